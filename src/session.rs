use std::{collections::HashMap, hash::Hash, net::IpAddr, sync::Arc, time::Duration};

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{Bitrate, CatalogError, SegmentCatalog},
    simulator::{DeliveryError, DeliveryResult, StreamSimulator},
};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("no session is open for client {0}")]
    UnknownClient(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentRequest {
    pub bitrate: Bitrate,
    pub segment_index: i64,
    pub bytes_sent: u64,
    pub duration: Duration,
}

/// One client's playback of one catalog.
#[derive(Debug)]
pub struct Session {
    catalog: Arc<SegmentCatalog>,
    simulator: StreamSimulator,
    history: Vec<SegmentRequest>,
}

impl Session {
    pub fn open(catalog: Arc<SegmentCatalog>, simulator: StreamSimulator) -> Self {
        Self {
            catalog,
            simulator,
            history: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<SegmentCatalog> {
        &self.catalog
    }

    pub fn history(&self) -> &[SegmentRequest] {
        &self.history
    }

    pub fn served_count(&self) -> usize {
        self.history.len()
    }

    pub async fn serve_segment<W>(
        &mut self,
        sink: &mut W,
        bitrate: Bitrate,
        segment_index: i64,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let size = self.catalog.segment_size(bitrate, segment_index)?;
        let result = self
            .simulator
            .deliver_cancellable(sink, size, cancel)
            .await?;

        tracing::info!(
            bitrate,
            segment_index,
            segment_size = size,
            stream_time = result.duration_secs(),
            stream_rate_kbps = result.throughput_kbps(),
            "served segment"
        );
        self.history.push(SegmentRequest {
            bitrate,
            segment_index,
            bytes_sent: result.bytes_sent,
            duration: result.duration,
        });
        Ok(result)
    }
}

/// Owns the active session of every client. At most one session per client.
#[derive(Debug)]
pub struct SessionRegistry<K = IpAddr> {
    sessions: HashMap<K, Session>,
    simulator: StreamSimulator,
}

impl<K> SessionRegistry<K>
where
    K: Hash + Eq + std::fmt::Display,
{
    pub fn new(simulator: StreamSimulator) -> Self {
        Self {
            sessions: HashMap::new(),
            simulator,
        }
    }

    /// Opens a session for `client`, discarding any session it already had.
    pub fn open(&mut self, client: K, catalog: Arc<SegmentCatalog>) -> &mut Session {
        let session = Session::open(catalog, self.simulator.clone());
        if let Some(prev) = self.sessions.remove(&client) {
            tracing::info!(
                %client,
                served = prev.served_count(),
                "replacing existing session"
            );
        } else {
            tracing::info!(%client, "session opened");
        }
        self.sessions.entry(client).or_insert(session)
    }

    pub fn get(&self, client: &K) -> Option<&Session> {
        self.sessions.get(client)
    }

    pub fn get_mut(&mut self, client: &K) -> Option<&mut Session> {
        self.sessions.get_mut(client)
    }

    pub fn close(&mut self, client: &K) -> Option<Session> {
        let session = self.sessions.remove(client);
        if session.is_some() {
            tracing::info!(%client, "session closed");
        }
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn serve_segment<W>(
        &mut self,
        client: &K,
        sink: &mut W,
        bitrate: Bitrate,
        segment_index: i64,
        cancel: &CancellationToken,
    ) -> Result<DeliveryResult, SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let session = self
            .sessions
            .get_mut(client)
            .ok_or_else(|| SessionError::UnknownClient(client.to_string()))?;
        session
            .serve_segment(sink, bitrate, segment_index, cancel)
            .await
    }
}
