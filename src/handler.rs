use crate::{
    adapter::DhtEngine,
    bloom::BloomFilter,
    info_hash::InfoHash,
    lookup::{HealthInfo, LookupState},
    registry::{TransactionId, TransactionRegistry},
    timer::{Timeout, Timer},
};
use futures_util::StreamExt;
use std::{collections::HashMap, mem, sync::Arc};
use tokio::{
    select,
    sync::{
        mpsc::{self, error::TryRecvError},
        oneshot,
    },
    time::Instant,
};

/// Snapshot of the manager internals, for debugging.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DebugState {
    pub is_running: bool,
    /// Number of lookups that are collecting responses.
    pub lookup_count: usize,
    /// Number of transaction ids currently attributed to a lookup.
    pub transaction_count: usize,
}

/// Task that the manager will execute immediately.
pub(crate) enum OneshotTask {
    /// Start a health lookup or join the one already running for the same info hash.
    StartLookup(StartLookup),
    /// The engine is about to send a `get_peers` query.
    OutgoingQuery {
        tid: TransactionId,
        info_hash: InfoHash,
    },
    /// The engine received a response carrying scrape filters.
    Response {
        tid: TransactionId,
        seeders: Option<BloomFilter>,
        peers: Option<BloomFilter>,
    },
    /// Retrieve debug information.
    GetDebugState(oneshot::Sender<DebugState>),
    /// Finalize every lookup and stop.
    Shutdown,
}

pub(crate) struct StartLookup {
    pub info_hash: InfoHash,
    pub deadline: Instant,
    pub tx: oneshot::Sender<HealthInfo>,
}

/// Task that the manager will execute some time later.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ScheduledTask {
    /// The collection window of the lookup is over.
    Finalize(InfoHash),
}

struct ActiveLookup {
    state: LookupState,
    timeout: Timeout,
}

/// Owns all lookup state. Every state transition happens on the task running `run`.
pub(crate) struct HealthHandler {
    running: bool,
    engine: Arc<dyn DhtEngine>,
    command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    timer: Timer<ScheduledTask>,
    // At most one live lookup per info hash. Removed on finalization.
    lookups: HashMap<InfoHash, ActiveLookup>,
    registry: TransactionRegistry,
}

impl HealthHandler {
    pub fn new(
        engine: Arc<dyn DhtEngine>,
        command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    ) -> Self {
        Self {
            running: true,
            engine,
            command_rx,
            timer: Timer::new(),
            lookups: HashMap::new(),
            registry: TransactionRegistry::new(),
        }
    }

    pub async fn run(mut self) {
        while self.running {
            self.run_once().await
        }
    }

    async fn run_once(&mut self) {
        select! {
            task = self.timer.next(), if !self.timer.is_empty() => {
                // `unwrap` is OK because we checked the timer is non-empty, so it should never
                // return `None`.
                let task = task.unwrap();
                // Events queued before the deadline fired still count towards the lookup.
                self.drain_commands();
                self.handle_timeout(task)
            }
            command = self.command_rx.recv() => {
                if let Some(command) = command {
                    self.handle_command(command)
                } else {
                    self.shutdown()
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while self.running {
            match self.command_rx.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.shutdown(),
            }
        }
    }

    fn handle_command(&mut self, task: OneshotTask) {
        match task {
            OneshotTask::StartLookup(lookup) => self.handle_start_lookup(lookup),
            OneshotTask::OutgoingQuery { tid, info_hash } => {
                self.handle_outgoing_query(tid, info_hash)
            }
            OneshotTask::Response {
                tid,
                seeders,
                peers,
            } => self.handle_response(tid, seeders, peers),
            OneshotTask::GetDebugState(tx) => self.handle_get_debug_state(tx),
            OneshotTask::Shutdown => self.shutdown(),
        }
    }

    fn handle_timeout(&mut self, task: ScheduledTask) {
        match task {
            ScheduledTask::Finalize(info_hash) => self.handle_finalize(info_hash),
        }
    }

    fn handle_start_lookup(&mut self, lookup: StartLookup) {
        let StartLookup {
            info_hash,
            deadline,
            tx,
        } = lookup;

        if let Some(active) = self.lookups.get_mut(&info_hash) {
            active.state.subscribe(tx);
            log::debug!(
                "Joined health lookup for {:?} ({} subscribers)",
                info_hash,
                active.state.subscriber_count()
            );
            return;
        }

        let mut state = LookupState::new(info_hash, deadline);
        state.subscribe(tx);

        log::debug!(
            "Starting health lookup for {:?} (finalizing in {:?})",
            info_hash,
            state.deadline().saturating_duration_since(Instant::now())
        );

        let timeout = self
            .timer
            .schedule_at(deadline, ScheduledTask::Finalize(info_hash));
        self.lookups
            .insert(info_hash, ActiveLookup { state, timeout });

        self.engine.start_get_peers(info_hash);
    }

    fn handle_outgoing_query(&mut self, tid: TransactionId, info_hash: InfoHash) {
        if self.lookups.contains_key(&info_hash) {
            log::trace!("Query {:?} belongs to health lookup for {:?}", tid, info_hash);
            self.registry.bind(tid, info_hash);
        } else if let Some(previous) = self.registry.unbind(&tid) {
            // The engine reused the id for a query we are not interested in.
            log::trace!(
                "Query {:?} no longer belongs to health lookup for {:?}",
                tid,
                previous
            );
        }
    }

    fn handle_response(
        &mut self,
        tid: TransactionId,
        seeders: Option<BloomFilter>,
        peers: Option<BloomFilter>,
    ) {
        let info_hash = match self.registry.lookup(&tid) {
            Some(info_hash) => info_hash,
            None => {
                log::trace!("Dropping scrape response to unknown query {:?}", tid);
                return;
            }
        };

        let active = match self.lookups.get_mut(&info_hash) {
            Some(active) if !active.state.is_finalized() => active,
            _ => {
                log::trace!(
                    "Dropping scrape response to query {:?} - no live lookup for {:?}",
                    tid,
                    info_hash
                );
                return;
            }
        };

        log::trace!(
            "Merging scrape response to query {:?} into lookup for {:?} (seeders: {}, peers: {})",
            tid,
            info_hash,
            seeders.is_some(),
            peers.is_some()
        );

        if let Err(error) = active.state.merge(seeders, peers) {
            log::trace!("Dropping scrape response to query {:?}: {}", tid, error);
        }
    }

    fn handle_finalize(&mut self, info_hash: InfoHash) {
        if let Some(active) = self.lookups.remove(&info_hash) {
            self.finalize(active)
        }
    }

    fn handle_get_debug_state(&self, tx: oneshot::Sender<DebugState>) {
        let state = DebugState {
            is_running: self.running,
            lookup_count: self.lookups.len(),
            transaction_count: self.registry.len(),
        };

        tx.send(state).unwrap_or(())
    }

    fn finalize(&mut self, mut active: ActiveLookup) {
        // No-op when called because the timeout fired.
        self.timer.cancel(active.timeout);

        let info_hash = active.state.info_hash();
        let subscribers = active.state.subscriber_count();

        match active.state.finalize() {
            Ok(info) => log::debug!(
                "Finished health lookup for {:?}: {} seeders, {} leechers ({} subscribers)",
                info_hash,
                info.seeders,
                info.leechers,
                subscribers
            ),
            Err(error) => log::warn!("Failed to finalize lookup for {:?}: {}", info_hash, error),
        }

        let swept = self.registry.unbind_all_for(&info_hash);
        log::trace!("Swept {} queries of lookup for {:?}", swept, info_hash);
    }

    fn shutdown(&mut self) {
        if !self.running {
            return;
        }

        log::debug!(
            "Shutting down health manager ({} lookups pending)",
            self.lookups.len()
        );

        self.running = false;
        self.command_rx.close();

        for (_, active) in mem::take(&mut self.lookups) {
            self.finalize(active)
        }
    }
}
