use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::core::pipeline::{PipelineClient, PipelineError, VoicePipeline};
use crate::core::session::{SessionRegistry, SessionSettings};

/// Why a WebSocket upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionLimitError {
    #[error("global WebSocket connection limit reached")]
    GlobalLimitReached,
    #[error("per-IP connection limit reached")]
    PerIpLimitReached,
}

/// Application state that can be shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    /// Runs transcribe → generate → synthesize for every session
    pub pipeline: Arc<dyn VoicePipeline>,
    pub sessions: SessionRegistry,
    session_settings: SessionSettings,
    started_at: Instant,
    ws_connections: AtomicUsize,
    ip_connections: Mutex<HashMap<IpAddr, u32>>,
}

impl AppState {
    /// Build state with the HTTP pipeline described by `config`.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, PipelineError> {
        let pipeline = PipelineClient::from_config(&config)?;
        Ok(Self::with_pipeline(config, Arc::new(pipeline)))
    }

    /// Build state around an existing pipeline implementation.
    pub fn with_pipeline(config: ServerConfig, pipeline: Arc<dyn VoicePipeline>) -> Arc<Self> {
        let session_settings = SessionSettings::from_config(&config);
        Arc::new(Self {
            config,
            pipeline,
            sessions: SessionRegistry::new(),
            session_settings,
            started_at: Instant::now(),
            ws_connections: AtomicUsize::new(0),
            ip_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn session_settings(&self) -> &SessionSettings {
        &self.session_settings
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Reserve a WebSocket slot for `ip`.
    ///
    /// Both limits are checked and updated under one lock so concurrent
    /// upgrades cannot overshoot either of them.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let mut per_ip = self.ip_connections.lock();

        if let Some(max) = self.config.max_websocket_connections
            && self.ws_connections.load(Ordering::SeqCst) >= max
        {
            return Err(ConnectionLimitError::GlobalLimitReached);
        }

        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.config.max_connections_per_ip {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        *count += 1;
        self.ws_connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Return a slot taken by [`try_acquire_connection`](Self::try_acquire_connection).
    pub fn release_connection(&self, ip: IpAddr) {
        let mut per_ip = self.ip_connections.lock();
        let Some(count) = per_ip.get_mut(&ip) else {
            tracing::warn!(%ip, "Releasing a connection that was never acquired");
            return;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            per_ip.remove(&ip);
        }
        let _ = self
            .ws_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> u32 {
        self.ip_connections.lock().get(ip).copied().unwrap_or(0)
    }
}
