use crate::{
    adapter::{DhtEngine, HealthHooks},
    bloom::BloomFilter,
    handler::{DebugState, HealthHandler, OneshotTask, StartLookup},
    info_hash::{InfoHash, LengthError},
    lookup::HealthInfo,
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task,
    time::Instant,
};

/// How long a lookup collects responses when no explicit timeout is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthError {
    #[error("invalid info hash")]
    InvalidInfoHash(#[from] LengthError),
    #[error("invalid timeout")]
    InvalidTimeout,
}

/// Estimates the swarm size of torrents from BEP33 scrapes collected by a DHT engine.
///
/// This type is cheaply cloneable where each clone refers to the same underlying manager. The
/// manager keeps running until [`HealthManager::shutdown`] is called or all clones are dropped.
///
/// The engine reports its traffic through the handle returned by [`HealthManager::hooks`], which
/// does not keep the manager running.
#[derive(Clone)]
pub struct HealthManager {
    send: mpsc::UnboundedSender<OneshotTask>,
    default_timeout: Duration,
}

impl HealthManager {
    /// Create a new HealthManagerBuilder.
    pub fn builder() -> HealthManagerBuilder {
        HealthManagerBuilder {
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    fn with_builder(builder: HealthManagerBuilder, engine: Arc<dyn DhtEngine>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handler = HealthHandler::new(engine, command_rx);

        task::spawn(handler.run());

        Self {
            send: command_tx,
            default_timeout: builder.default_timeout,
        }
    }

    /// Estimate the health of the torrent with the given info hash, collecting responses for the
    /// default timeout.
    ///
    /// See [`HealthManager::lookup_with_timeout`].
    pub fn lookup<B: AsRef<[u8]>>(&self, info_hash: B) -> Result<HealthLookup, HealthError> {
        self.lookup_with_timeout(info_hash, self.default_timeout)
    }

    /// Estimate the health of the torrent with the given info hash.
    ///
    /// Starts a `get_peers` lookup on the DHT engine and resolves once `timeout` elapses, with the
    /// estimate computed from all scrape responses received until then. If a lookup for the same
    /// info hash is already running, no new DHT query is started and the returned future resolves
    /// together with the running lookup (whose deadline is kept).
    ///
    /// Fails if `info_hash` is not exactly 20 bytes long or if `timeout` is zero.
    pub fn lookup_with_timeout<B: AsRef<[u8]>>(
        &self,
        info_hash: B,
        timeout: Duration,
    ) -> Result<HealthLookup, HealthError> {
        let info_hash = InfoHash::try_from(info_hash.as_ref())?;

        if timeout.is_zero() {
            return Err(HealthError::InvalidTimeout);
        }

        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or(HealthError::InvalidTimeout)?;

        let (tx, rx) = oneshot::channel();

        if self
            .send
            .send(OneshotTask::StartLookup(StartLookup {
                info_hash,
                deadline,
                tx,
            }))
            .is_err()
        {
            log::error!("failed to start health lookup - HealthHandler has shut down");
        }

        Ok(HealthLookup { info_hash, rx })
    }

    /// Get the state of the manager, can be used for debugging. Returns `None` if the manager has
    /// shut down.
    pub async fn debug_state(&self) -> Option<DebugState> {
        let (tx, rx) = oneshot::channel();

        if self.send.send(OneshotTask::GetDebugState(tx)).is_err() {
            None
        } else {
            rx.await.ok()
        }
    }

    /// Finalize all running lookups with the responses collected so far and stop the manager.
    /// Lookups started afterwards resolve to an empty estimate immediately.
    pub fn shutdown(&self) {
        if self.send.send(OneshotTask::Shutdown).is_err() {
            log::debug!("HealthHandler has already shut down");
        }
    }

    /// Get the [`HealthHooks`] the DHT engine reports its `get_peers` traffic to.
    ///
    /// Unlike clones of the manager, the returned handle does not keep the manager running, so it
    /// can be owned by the engine (for example inside a [`ScrapeSocket`](crate::ScrapeSocket))
    /// which in turn is owned by the manager.
    pub fn hooks(&self) -> HealthHooksHandle {
        HealthHooksHandle {
            send: self.send.downgrade(),
        }
    }
}

/// [`HealthHooks`] that forward DHT events to a [`HealthManager`], obtained from
/// [`HealthManager::hooks`]. Events reported after the manager stopped are ignored.
#[derive(Clone)]
pub struct HealthHooksHandle {
    send: mpsc::WeakUnboundedSender<OneshotTask>,
}

impl HealthHooksHandle {
    fn send_event(&self, task: OneshotTask) {
        let sent = match self.send.upgrade() {
            Some(send) => send.send(task).is_ok(),
            None => false,
        };

        if !sent {
            log::trace!("Ignoring DHT event - HealthHandler has shut down");
        }
    }
}

impl HealthHooks for HealthHooksHandle {
    fn on_outgoing_query(&self, tid: &[u8], info_hash: InfoHash) {
        self.send_event(OneshotTask::OutgoingQuery {
            tid: tid.into(),
            info_hash,
        })
    }

    fn on_response(&self, tid: &[u8], seeders: Option<BloomFilter>, peers: Option<BloomFilter>) {
        self.send_event(OneshotTask::Response {
            tid: tid.into(),
            seeders,
            peers,
        })
    }
}

/// Future returned from [`HealthManager::lookup()`]
///
/// Dropping it does not stop the lookup: other subscribers still get the result.
#[must_use = "futures do nothing unless polled"]
pub struct HealthLookup {
    info_hash: InfoHash,
    rx: oneshot::Receiver<HealthInfo>,
}

impl HealthLookup {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
}

impl Future for HealthLookup {
    type Output = HealthInfo;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let info_hash = self.info_hash;

        // The sender is only dropped without a value when the handler is gone.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| HealthInfo::empty(info_hash)))
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for initializing a HealthManager.
#[derive(Debug)]
pub struct HealthManagerBuilder {
    default_timeout: Duration,
}

impl HealthManagerBuilder {
    /// Set the timeout used by [`HealthManager::lookup`]. Defaults to [`DEFAULT_TIMEOUT`].
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Start the manager on top of the given DHT engine. Must be called from within a tokio
    /// runtime.
    pub fn start<E: DhtEngine + 'static>(self, engine: E) -> HealthManager {
        HealthManager::with_builder(self, Arc::new(engine))
    }
}
