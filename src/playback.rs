use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::Bitrate,
    controller::{ControllerError, RateController},
    estimator::ThroughputEstimator,
    session::{Session, SessionError},
};

#[derive(thiserror::Error, Debug)]
pub enum PlaybackError {
    #[error("catalog has no segments to play")]
    EmptyCatalog,

    #[error("segment {segment_index}: {source}")]
    Controller {
        segment_index: i64,
        #[source]
        source: ControllerError,
    },

    #[error("segment {segment_index}: {source}")]
    Session {
        segment_index: i64,
        #[source]
        source: SessionError,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackConfig {
    /// Stop after this many segments; `None` plays the catalog's playback duration.
    pub segments: Option<usize>,
    /// `None` takes the catalog's segment duration.
    pub segment_duration: Option<Duration>,
    /// Buffer needed before playback starts; `None` takes the catalog's minimum buffer time.
    pub min_buffer: Option<Duration>,
    pub max_buffer: Duration,
    pub initial_buffer: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            segments: None,
            segment_duration: None,
            min_buffer: None,
            max_buffer: Duration::from_secs(30),
            initial_buffer: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentLog {
    pub segment_index: i64,
    pub bitrate: Bitrate,
    pub bytes: u64,
    pub download_secs: f64,
    pub estimate_kbps: Option<f64>,
    pub buffer_before_secs: f64,
    pub buffer_after_secs: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlaybackReport {
    pub segments: Vec<SegmentLog>,
    pub startup_delay_secs: f64,
    pub rebuffer_secs: f64,
    pub switches: usize,
    pub mean_bitrate: f64,
}

/// Client side of a simulated playback: pick a bitrate, fetch, update the buffer, repeat.
#[derive(Debug)]
pub struct Player {
    controller: RateController,
    estimator: ThroughputEstimator,
    config: PlaybackConfig,
    buffer_level: f64,
}

impl Player {
    pub fn new(
        controller: RateController,
        estimator: ThroughputEstimator,
        config: PlaybackConfig,
    ) -> Self {
        let buffer_level = config.initial_buffer.as_secs_f64();
        Self {
            controller,
            estimator,
            config,
            buffer_level,
        }
    }

    pub fn buffer_level(&self) -> f64 {
        self.buffer_level
    }

    pub fn estimator(&self) -> &ThroughputEstimator {
        &self.estimator
    }

    pub async fn run<W>(
        &mut self,
        session: &mut Session,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<PlaybackReport, PlaybackError>
    where
        W: AsyncWrite + Unpin,
    {
        let catalog = session.catalog().clone();
        let info = *catalog.media_info();
        let segment_duration = self.config.segment_duration.unwrap_or(info.segment_duration);
        let min_buffer = self.config.min_buffer.unwrap_or(info.min_buffer_time).as_secs_f64();

        let bitrates: Vec<Bitrate> = catalog.bitrates().collect();
        let available = bitrates
            .iter()
            .filter_map(|b| catalog.segment_count(*b).ok())
            .min()
            .unwrap_or_default();
        let wanted = self
            .config
            .segments
            .unwrap_or_else(|| segments_in(info.playback_duration, segment_duration));
        let total = wanted.min(available);
        let Some(mut previous) = catalog.lowest_bitrate().filter(|_| total > 0) else {
            return Err(PlaybackError::EmptyCatalog);
        };

        let segment_secs = segment_duration.as_secs_f64();
        let max_buffer = self.config.max_buffer.as_secs_f64().max(segment_secs);
        let mut playing = self.buffer_level >= min_buffer;
        let mut report = PlaybackReport::default();

        for segment_index in 1..=total as i64 {
            let decision = self
                .controller
                .next_bitrate(&bitrates, &self.estimator, self.buffer_level, previous)
                .map_err(|source| PlaybackError::Controller {
                    segment_index,
                    source,
                })?;

            let result = session
                .serve_segment(sink, decision.bitrate, segment_index, cancel)
                .await
                .map_err(|source| PlaybackError::Session {
                    segment_index,
                    source,
                })?;
            self.estimator.record(result.bytes_sent, result.duration);

            let download = result.duration_secs();
            let buffer_before = self.buffer_level;
            let drained = if playing {
                if download > buffer_before {
                    report.rebuffer_secs += download - buffer_before;
                }
                (buffer_before - download).max(0.0)
            } else {
                report.startup_delay_secs += download;
                buffer_before
            };
            self.buffer_level = (drained + segment_secs).min(max_buffer);
            if !playing && self.buffer_level >= min_buffer {
                playing = true;
                tracing::debug!(
                    startup_delay = report.startup_delay_secs,
                    "playback started"
                );
            }

            if segment_index > 1 && decision.bitrate != previous {
                report.switches += 1;
            }
            previous = decision.bitrate;

            tracing::debug!(
                segment_index,
                bitrate = decision.bitrate,
                estimate_kbps = decision.estimate_kbps,
                buffer = self.buffer_level,
                "segment played"
            );
            report.segments.push(SegmentLog {
                segment_index,
                bitrate: decision.bitrate,
                bytes: result.bytes_sent,
                download_secs: download,
                estimate_kbps: decision.estimate_kbps,
                buffer_before_secs: buffer_before,
                buffer_after_secs: self.buffer_level,
            });
        }

        report.mean_bitrate = report.segments.iter().map(|s| s.bitrate as f64).sum::<f64>()
            / report.segments.len() as f64;
        tracing::info!(
            segments = report.segments.len(),
            rebuffer_secs = report.rebuffer_secs,
            switches = report.switches,
            mean_bitrate = report.mean_bitrate,
            "playback finished"
        );
        Ok(report)
    }
}

/// Whole segments needed to cover `playback`, rounding up.
fn segments_in(playback: Duration, segment: Duration) -> usize {
    if segment.is_zero() {
        return 0;
    }
    playback.as_nanos().div_ceil(segment.as_nanos()) as usize
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        catalog::{MediaInfo, SegmentCatalog},
        simulator::{DeliveryConfig, RateLimit, StreamSimulator},
        table::{QuantizedDecisionTable, TableRow},
    };

    /// Switches to the high rate only when bandwidth and buffer are both in the top bin.
    fn table() -> Arc<QuantizedDecisionTable> {
        let mut rows = Vec::new();
        for bandwidth in [0.0, 1000.0] {
            for buffer in [0.0, 4.0] {
                for prerate in [300_000, 1_000_000] {
                    let next_bitrate = if bandwidth >= 1000.0 && buffer >= 4.0 {
                        1_000_000
                    } else {
                        300_000
                    };
                    rows.push(TableRow {
                        bandwidth,
                        buffer,
                        prerate,
                        next_bitrate,
                    });
                }
            }
        }
        Arc::new(QuantizedDecisionTable::load(rows).unwrap())
    }

    fn session(target_kbps: f64) -> Session {
        session_with(target_kbps, MediaInfo::default())
    }

    fn session_with(target_kbps: f64, info: MediaInfo) -> Session {
        let mut metadata = String::new();
        for i in 1..=4 {
            metadata.push_str(&format!("300000 {i} 0 150000 0.9\n"));
            metadata.push_str(&format!("1000000 {i} 0 500000 0.97\n"));
        }
        let catalog = Arc::new(SegmentCatalog::parse(&metadata).unwrap().with_media_info(info));
        let simulator = StreamSimulator::new(DeliveryConfig {
            block_size: 10_000,
            rate_limit: RateLimit::new(target_kbps, Duration::from_secs(5)),
            timeout: None,
        });
        Session::open(catalog, simulator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_link_climbs_to_high_rate() {
        // 150 KB at 12 Mbps is 0.1s per low segment
        let mut session = session(12_000.0);
        let mut player = Player::new(
            RateController::new(table()),
            ThroughputEstimator::new(3),
            PlaybackConfig::default(),
        );
        let report = player
            .run(&mut session, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap();

        let rates: Vec<Bitrate> = report.segments.iter().map(|s| s.bitrate).collect();
        assert_eq!(rates, vec![300_000, 1_000_000, 1_000_000, 1_000_000]);
        assert_eq!(report.switches, 1);
        assert_eq!(report.segments[0].estimate_kbps, None);
        assert_eq!(report.rebuffer_secs, 0.0);
        assert_eq!(session.served_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_link_stays_low_and_rebuffers() {
        // 150 KB at 200 kbps is 6s per segment, longer than a segment lasts
        let mut session = session(200.0);
        let mut player = Player::new(
            RateController::new(table()),
            ThroughputEstimator::new(3),
            PlaybackConfig {
                segments: Some(3),
                ..PlaybackConfig::default()
            },
        );
        let report = player
            .run(&mut session, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.segments.len(), 3);
        assert!(report.segments.iter().all(|s| s.bitrate == 300_000));
        assert!(report.rebuffer_secs > 0.0);
        assert_eq!(report.switches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_info_drives_defaults() {
        // 150 KB at 600 kbps is 2s per low segment, too slow for the high rate
        let info = MediaInfo {
            segment_duration: Duration::from_secs(2),
            playback_duration: Duration::from_secs(5),
            min_buffer_time: Duration::from_secs(3),
        };
        let mut session = session_with(600.0, info);
        let mut player = Player::new(
            RateController::new(table()),
            ThroughputEstimator::new(3),
            PlaybackConfig::default(),
        );
        let report = player
            .run(&mut session, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap();

        // ceil(5s / 2s) segments, startup lasts until 3s are buffered
        assert_eq!(report.segments.len(), 3);
        assert!(report.segments.iter().all(|s| s.bitrate == 300_000));
        assert!((report.startup_delay_secs - 4.0).abs() < 0.05, "{report:?}");
        assert_eq!(report.segments[0].buffer_after_secs, 2.0);
        assert_eq!(report.segments[1].buffer_after_secs, 4.0);
        assert!((report.segments[2].buffer_after_secs - 4.0).abs() < 0.05);
        assert_eq!(report.rebuffer_secs, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_config_overrides_media_info() {
        let mut session = session(12_000.0);
        let mut player = Player::new(
            RateController::new(table()),
            ThroughputEstimator::new(3),
            PlaybackConfig {
                segments: Some(2),
                segment_duration: Some(Duration::from_secs(1)),
                min_buffer: Some(Duration::ZERO),
                ..PlaybackConfig::default()
            },
        );
        let report = player
            .run(&mut session, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.startup_delay_secs, 0.0);
        assert!((report.segments[0].buffer_after_secs - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_segments_in_rounds_up() {
        assert_eq!(segments_in(Duration::from_secs(300), Duration::from_secs(4)), 75);
        assert_eq!(segments_in(Duration::from_secs(5), Duration::from_secs(2)), 3);
        assert_eq!(segments_in(Duration::from_secs(5), Duration::ZERO), 0);
    }
}
