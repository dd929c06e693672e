use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_MAX_PACING_WAIT: Duration = Duration::from_secs(1);

const FILLER: u8 = b'a';

#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("source {path:?} is unavailable: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io failed after {bytes_sent} bytes: {source}")]
    Io {
        bytes_sent: u64,
        #[source]
        source: io::Error,
    },

    #[error("delivery timed out after {bytes_sent} bytes")]
    TimedOut { bytes_sent: u64 },

    #[error("delivery cancelled after {bytes_sent} bytes")]
    Cancelled { bytes_sent: u64 },
}

/// Caps delivery at `target_kbps` (1000 bits per kilobit).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimit {
    target_kbps: f64,
    max_wait: Duration,
}

impl RateLimit {
    /// Returns `None` unless `target_kbps` is positive and finite.
    pub fn new(target_kbps: f64, max_wait: Duration) -> Option<Self> {
        (target_kbps.is_finite() && target_kbps > 0.0).then_some(Self {
            target_kbps,
            max_wait,
        })
    }

    pub fn target_kbps(&self) -> f64 {
        self.target_kbps
    }

    /// Time a block of `len` bytes occupies at the target rate, saturating at `Duration::MAX`.
    fn block_interval(&self, len: usize) -> Duration {
        let secs = len as f64 * 8.0 / (self.target_kbps * 1000.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryConfig {
    pub block_size: usize,
    pub rate_limit: Option<RateLimit>,
    pub timeout: Option<Duration>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            rate_limit: None,
            timeout: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeliveryResult {
    pub duration: Duration,
    pub bytes_sent: u64,
}

impl DeliveryResult {
    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }

    /// Observed rate in kbps, `None` for an instantaneous delivery.
    pub fn throughput_kbps(&self) -> Option<f64> {
        let secs = self.duration_secs();
        (secs > 0.0).then(|| self.bytes_sent as f64 * 8.0 / secs / 1024.0)
    }
}

/// Withholds the next block until the rate since the last boundary is at or below target.
struct Pacer {
    limit: Option<RateLimit>,
    last_boundary: Instant,
}

impl Pacer {
    fn new(limit: Option<RateLimit>, now: Instant) -> Self {
        Self {
            limit,
            last_boundary: now,
        }
    }

    fn wait_after(&self, block_len: usize) -> Option<Duration> {
        let limit = self.limit?;
        let interval = limit.block_interval(block_len);
        let wait = interval.checked_sub(self.last_boundary.elapsed())?;
        (!wait.is_zero()).then(|| wait.min(limit.max_wait))
    }

    fn mark(&mut self) {
        self.last_boundary = Instant::now();
    }
}

struct Guard<'a> {
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
}

impl Guard<'_> {
    async fn run<T>(
        &self,
        bytes_sent: u64,
        fut: impl Future<Output = io::Result<T>>,
    ) -> Result<T, DeliveryError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DeliveryError::Cancelled { bytes_sent }),
            _ = deadline_elapsed(self.deadline) => Err(DeliveryError::TimedOut { bytes_sent }),
            res = fut => res.map_err(|source| DeliveryError::Io { bytes_sent, source }),
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Writes segments to a sink in fixed-size blocks and times the transfer.
#[derive(Clone, Debug)]
pub struct StreamSimulator {
    config: DeliveryConfig,
    filler: Bytes,
}

impl Default for StreamSimulator {
    fn default() -> Self {
        Self::new(DeliveryConfig::default())
    }
}

impl StreamSimulator {
    pub fn new(mut config: DeliveryConfig) -> Self {
        config.block_size = config.block_size.max(1);
        let filler = Bytes::from(vec![FILLER; config.block_size]);
        Self { config, filler }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Synthetic delivery of `byte_count` filler bytes.
    pub async fn deliver<W>(
        &self,
        sink: &mut W,
        byte_count: u64,
    ) -> Result<DeliveryResult, DeliveryError>
    where
        W: AsyncWrite + Unpin,
    {
        self.deliver_cancellable(sink, byte_count, &CancellationToken::new())
            .await
    }

    #[tracing::instrument(name = "deliver_synthetic", skip_all, fields(byte_count = byte_count))]
    pub async fn deliver_cancellable<W>(
        &self,
        sink: &mut W,
        byte_count: u64,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, DeliveryError>
    where
        W: AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let guard = self.guard(cancel, start);
        let mut pacer = Pacer::new(self.config.rate_limit, start);
        let mut sent: u64 = 0;

        while sent < byte_count {
            let len = (byte_count - sent).min(self.config.block_size as u64) as usize;
            guard
                .run(sent, sink.write_all(&self.filler[..len]))
                .await?;
            sent += len as u64;
            self.pace(&guard, &mut pacer, sent, len).await?;
        }

        self.finish(&guard, sink, start, sent).await
    }

    /// Sourced delivery: copies `source` to `sink` until the source is exhausted.
    #[tracing::instrument(name = "deliver_sourced", skip_all)]
    pub async fn deliver_from<R, W>(
        &self,
        source: &mut R,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, DeliveryError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let guard = self.guard(cancel, start);
        let mut pacer = Pacer::new(self.config.rate_limit, start);
        let mut buf = vec![0u8; self.config.block_size];
        let mut sent: u64 = 0;

        loop {
            let len = guard.run(sent, read_block(source, &mut buf)).await?;
            if len == 0 {
                break;
            }
            guard.run(sent, sink.write_all(&buf[..len])).await?;
            sent += len as u64;
            if len < buf.len() {
                break;
            }
            self.pace(&guard, &mut pacer, sent, len).await?;
        }

        self.finish(&guard, sink, start, sent).await
    }

    /// Opens `path` and delivers its contents. Failing to open is `SourceUnavailable`;
    /// substituting fallback content is up to the caller.
    pub async fn deliver_file<W>(
        &self,
        path: impl AsRef<Path>,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, DeliveryError>
    where
        W: AsyncWrite + Unpin,
    {
        let path = path.as_ref();
        let mut file =
            tokio::fs::File::open(path)
                .await
                .map_err(|source| DeliveryError::SourceUnavailable {
                    path: path.to_path_buf(),
                    source,
                })?;
        self.deliver_from(&mut file, sink, cancel).await
    }

    fn guard<'a>(&self, cancel: &'a CancellationToken, start: Instant) -> Guard<'a> {
        Guard {
            cancel,
            deadline: self.config.timeout.map(|t| start + t),
        }
    }

    async fn pace(
        &self,
        guard: &Guard<'_>,
        pacer: &mut Pacer,
        sent: u64,
        block_len: usize,
    ) -> Result<(), DeliveryError> {
        if let Some(wait) = pacer.wait_after(block_len) {
            tracing::trace!(?wait, sent, "pacing");
            guard
                .run(sent, async {
                    tokio::time::sleep(wait).await;
                    Ok(())
                })
                .await?;
        }
        pacer.mark();
        Ok(())
    }

    async fn finish<W>(
        &self,
        guard: &Guard<'_>,
        sink: &mut W,
        start: Instant,
        sent: u64,
    ) -> Result<DeliveryResult, DeliveryError>
    where
        W: AsyncWrite + Unpin,
    {
        guard.run(sent, sink.flush()).await?;
        let result = DeliveryResult {
            duration: start.elapsed(),
            bytes_sent: sent,
        };

        metrics::counter!("mpcstream_delivered_bytes_total").increment(sent);
        metrics::histogram!("mpcstream_delivery_seconds").record(result.duration_secs());
        tracing::debug!(
            bytes_sent = sent,
            duration = result.duration_secs(),
            "delivery finished"
        );
        Ok(result)
    }
}

/// Fills `buf` unless the source ends first; returns the number of bytes read.
async fn read_block<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
