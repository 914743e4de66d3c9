//! Transmission manager
//!
//! Moves processed frames from the [`FrameQueue`] to the collector, falling
//! back to the persistent [`BacklogStore`] whenever the link is down or the
//! collector refuses data.
//!
//! ## States
//!
//! - `Disconnected`: frames accumulate in memory and are persisted a batch at
//!   a time. Reconnection is attempted at most once per cooldown period.
//! - `ConnectedIdle`: linked, nothing to send.
//! - `ConnectedDraining`: the backlog is not empty. Fresh frames are appended
//!   behind it and one backlog batch is uploaded per cycle, deleted only once
//!   the collector acknowledges it.
//! - `ConnectedStreaming`: backlog empty, fresh frames go straight out.
//!
//! Any transport failure persists in-memory frames, forgets the server
//! address and returns to `Disconnected`. The next reconnect runs discovery
//! without a hint; only the collector stored in the settings is tried first,
//! and only at boot.

extern crate alloc;
use alloc::vec::Vec;

use embassy_time::{Instant, Timer};
use log::{debug, error, info, warn};

use crate::backlog::{BacklogStore, StorageMedium};
use crate::config::{PersistedSettings, PipelineConfig, ServerAddress, store_settings};
use crate::diagnostics::TransmitSnapshot;
use crate::error::{BacklogError, UploadError};
use crate::frame::ProcessedFrame;
use crate::http::{Connector, HttpUplink};
use crate::queue::FrameQueue;

/// Cycles between diagnostic log lines in [`TransmissionManager::run`]
const STATS_LOG_INTERVAL: u32 = 240;

/// Server discovery collaborator.
///
/// Returns a collector address that has just answered a liveness check,
/// trying `hint` first when given.
pub trait Discovery {
    fn verified_server_address(
        &mut self,
        hint: Option<ServerAddress>,
    ) -> impl Future<Output = Option<ServerAddress>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    ConnectedIdle,
    ConnectedDraining,
    ConnectedStreaming,
}

impl LinkState {
    pub const fn is_connected(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

pub struct TransmissionManager<'a, C, D, M, const Q: usize>
where
    C: Connector,
    D: Discovery,
    M: StorageMedium,
{
    queue: &'a FrameQueue<Q>,
    uplink: HttpUplink<C>,
    discovery: D,
    backlog: BacklogStore<M>,
    config: PipelineConfig,
    state: LinkState,
    server: Option<ServerAddress>,
    hint: Option<ServerAddress>,
    settings: Option<PersistedSettings>,
    last_attempt: Option<Instant>,
    /// Frames taken off the queue but not yet delivered or persisted
    pending: Vec<ProcessedFrame>,
    stats: TransmitSnapshot,
}

impl<'a, C, D, M, const Q: usize> TransmissionManager<'a, C, D, M, Q>
where
    C: Connector,
    D: Discovery,
    M: StorageMedium,
{
    pub fn new(
        queue: &'a FrameQueue<Q>,
        uplink: HttpUplink<C>,
        discovery: D,
        backlog: BacklogStore<M>,
        config: PipelineConfig,
    ) -> Self {
        let pending = Vec::with_capacity(config.pending_cap);
        Self {
            queue,
            uplink,
            discovery,
            backlog,
            config,
            state: LinkState::Disconnected,
            server: None,
            hint: None,
            settings: None,
            last_attempt: None,
            pending,
            stats: TransmitSnapshot::default(),
        }
    }

    /// Uses the last known collector as the first discovery hint and keeps
    /// it up to date in the stored settings.
    pub fn with_settings(mut self, settings: PersistedSettings) -> Self {
        self.hint = settings.last_server;
        self.settings = Some(settings);
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Currently verified collector, if connected.
    pub fn server(&self) -> Option<ServerAddress> {
        self.server
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> TransmitSnapshot {
        self.stats
    }

    pub fn backlog_mut(&mut self) -> &mut BacklogStore<M> {
        &mut self.backlog
    }

    pub fn uplink_mut(&mut self) -> &mut HttpUplink<C> {
        &mut self.uplink
    }

    /// Runs one transmission cycle as of `now`.
    pub async fn run_cycle(&mut self, now: Instant) {
        self.collect_pending();

        if self.state == LinkState::Disconnected {
            if self.pending.len() >= self.config.streaming_batch {
                self.persist_pending();
            }
            if !self.reconnect_due(now) || !self.reconnect(now).await {
                return;
            }
        }

        self.service_link(now).await;
    }

    pub async fn run(mut self) -> ! {
        let mut cycles = 0u32;
        loop {
            self.run_cycle(Instant::now()).await;

            cycles = cycles.wrapping_add(1);
            if cycles % STATS_LOG_INTERVAL == 0 {
                debug!("Transmit: {:?} {:?}", self.state, self.stats);
            }
            Timer::after(self.config.cycle_interval).await;
        }
    }

    /// Takes up to one streaming batch off the processed queue.
    fn collect_pending(&mut self) {
        for _ in 0..self.config.streaming_batch {
            match self.queue.try_pop() {
                Some(frame) => self.pending.push(frame),
                None => break,
            }
        }

        let cap = self.config.pending_cap.max(self.config.streaming_batch);
        if self.pending.len() > cap {
            let excess = self.pending.len() - cap;
            self.pending.drain(..excess);
            self.stats.frames_dropped = self.stats.frames_dropped.wrapping_add(excess as u32);
            warn!("Dropped {} oldest frames, nowhere to keep them", excess);
        }
    }

    /// Writes every pending frame to the backlog. Frames stay in memory when
    /// storage refuses them.
    fn persist_pending(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        match self.backlog.write(&self.pending) {
            Ok(()) => {
                self.stats.frames_persisted = self
                    .stats
                    .frames_persisted
                    .wrapping_add(self.pending.len() as u32);
                self.pending.clear();
                true
            }
            Err(BacklogError::StorageFull { .. }) => {
                warn!("Backlog full, holding {} frames in memory", self.pending.len());
                false
            }
            Err(e) => {
                self.storage_fault(e);
                false
            }
        }
    }

    fn storage_fault(&mut self, e: BacklogError) {
        error!("Backlog error: {}", e);
        self.stats.storage_faults = self.stats.storage_faults.wrapping_add(1);
    }

    fn reconnect_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.config.reconnect_cooldown,
        }
    }

    async fn reconnect(&mut self, now: Instant) -> bool {
        self.last_attempt = Some(now);
        self.stats.reconnect_attempts = self.stats.reconnect_attempts.wrapping_add(1);

        match self.discovery.verified_server_address(self.hint).await {
            Some(addr) => {
                info!("Collector verified at {}", addr);
                self.server = Some(addr);
                self.state = LinkState::ConnectedIdle;
                self.remember_server(addr);
                true
            }
            None => {
                debug!("No collector found, retrying in {} s", self.config.reconnect_cooldown.as_secs());
                false
            }
        }
    }

    fn remember_server(&mut self, addr: ServerAddress) {
        let Some(settings) = self.settings.as_mut() else {
            return;
        };
        if settings.last_server == Some(addr) {
            return;
        }

        settings.last_server = Some(addr);
        let settings = *settings;
        if let Err(e) = store_settings(self.backlog.medium_mut(), &settings) {
            warn!("Could not store collector address: {}", e);
        }
    }

    fn link_lost(&mut self, now: Instant) {
        warn!("Link to collector lost");
        self.persist_pending();
        self.server = None;
        self.hint = None;
        self.state = LinkState::Disconnected;
        self.last_attempt = Some(now);
    }

    fn upload_failed(&mut self, e: UploadError, now: Instant) {
        self.stats.upload_failures = self.stats.upload_failures.wrapping_add(1);
        match e {
            UploadError::Transport(_) => self.link_lost(now),
            UploadError::Rejected { status } => warn!("Collector rejected upload: {}", status),
            UploadError::Backlog(e) => self.storage_fault(e),
        }
    }

    async fn service_link(&mut self, now: Instant) {
        let Some(addr) = self.server else {
            self.state = LinkState::Disconnected;
            return;
        };

        let backlog_frames = match self.backlog.frame_count() {
            Ok(count) => count,
            Err(e) => {
                self.storage_fault(e);
                return;
            }
        };

        if backlog_frames > 0 {
            // Fresh frames go behind older backlogged ones
            self.persist_pending();
            self.state = LinkState::ConnectedDraining;
            self.drain_batch(addr, now).await;
        } else if self.pending.is_empty() {
            self.state = LinkState::ConnectedIdle;
        } else {
            self.state = LinkState::ConnectedStreaming;
            self.stream_pending(addr, now).await;
        }
    }

    /// Uploads one backlog batch and deletes it on acknowledgement.
    async fn drain_batch(&mut self, addr: ServerAddress, now: Instant) {
        let (count, result) = {
            let stream = match self.backlog.stream(self.config.backlog_batch, self.config.stream_chunk) {
                Ok(stream) => stream,
                Err(e) => {
                    self.storage_fault(e);
                    return;
                }
            };
            let count = stream.frame_count();
            let total = stream.total_bytes();
            (count, self.uplink.post(addr, total, stream).await)
        };

        if let Err(e) = result {
            self.upload_failed(e, now);
            return;
        }

        if let Err(e) = self.backlog.delete_prefix(count) {
            // Delivered frames stay in the backlog and are sent again later
            self.storage_fault(e);
            return;
        }
        self.stats.frames_drained = self.stats.frames_drained.wrapping_add(count as u32);

        match self.backlog.frame_count() {
            Ok(0) => {
                info!("Backlog drained");
                self.state = LinkState::ConnectedStreaming;
            }
            Ok(left) => debug!("{} backlog frames left", left),
            Err(e) => self.storage_fault(e),
        }
    }

    /// Uploads pending frames directly once enough have accumulated.
    async fn stream_pending(&mut self, addr: ServerAddress, now: Instant) {
        if self.pending.len() < self.config.min_stream_batch.max(1) {
            return;
        }

        let count = self.pending.len().min(self.config.streaming_batch);
        match self.uplink.post_frames(addr, &self.pending[..count]).await {
            Ok(_) => {
                self.pending.drain(..count);
                self.stats.frames_streamed = self.stats.frames_streamed.wrapping_add(count as u32);
            }
            Err(e) => {
                let link_lost = e.is_link_lost();
                self.upload_failed(e, now);
                if !link_lost {
                    self.persist_pending();
                    self.state = LinkState::ConnectedDraining;
                }
            }
        }
    }
}
