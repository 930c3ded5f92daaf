use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

use common::{
    EngineEvent, Error, Outcome, OutcomeStore, Phase, PricePathFeed, Result, RiskConfiguration,
    SourceKey, TrialLog,
};
use edge::EdgeValidator;
use optimizer::Optimizer;

use crate::config::EngineConfig;
use crate::phase::PhaseMachine;
use crate::state::SelectionState;
use crate::store::SelectionStore;
use crate::worker::{KeyCommand, KeyWorker};

/// Result of submitting one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Ingest {
    /// Folded into state; `phase` is the key's phase afterwards.
    Accepted { phase: Phase },
    /// `outcome_id` was already recorded.
    Duplicate,
}

/// Configuration chosen by the bandit for the next signal of a Live key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub key: SourceKey,
    pub arm: usize,
    pub trial_id: u32,
    pub config: RiskConfiguration,
}

/// Collaborators the engine persists through.
#[derive(Clone)]
pub struct Stores {
    pub outcomes: Arc<dyn OutcomeStore>,
    pub paths: Arc<dyn PricePathFeed>,
    pub trials: Arc<dyn TrialLog>,
    pub selections: Arc<dyn SelectionStore>,
}

impl Stores {
    /// Use one backend for every concern.
    pub fn single<S>(store: Arc<S>) -> Self
    where
        S: OutcomeStore + PricePathFeed + TrialLog + SelectionStore + 'static,
    {
        Self {
            outcomes: store.clone(),
            paths: store.clone(),
            trials: store.clone(),
            selections: store,
        }
    }
}

/// State shared by the router, the key workers and the handle.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) stores: Stores,
    pub(crate) validator: EdgeValidator,
    pub(crate) optimizer: Optimizer,
    pub(crate) machine: PhaseMachine,
    /// Latest committed state per key. Read by the handle without touching workers.
    pub(crate) snapshots: RwLock<HashMap<SourceKey, SelectionState>>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
}

enum EngineCommand {
    Outcome {
        outcome: Outcome,
        reply: oneshot::Sender<Result<Ingest>>,
    },
    Select {
        key: SourceKey,
        reply: oneshot::Sender<Result<Option<Selection>>>,
    },
    Deactivate {
        key: SourceKey,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle passed to other crates (API, binary).
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Feed one closed trade. Idempotent on `outcome_id`.
    pub async fn submit_outcome(&self, outcome: Outcome) -> Result<Ingest> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Outcome { outcome, reply }).await?;
        rx.await.map_err(|_| Error::EngineUnavailable)?
    }

    /// Bandit-selected configuration for the next signal. `None` unless the
    /// key is Live.
    pub async fn select_config(&self, key: &SourceKey) -> Result<Option<Selection>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Select {
            key: key.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::EngineUnavailable)?
    }

    /// Stop the key's worker and cancel its in-flight run, if any.
    /// Returns whether a worker was running.
    pub async fn deactivate(&self, key: &SourceKey) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Deactivate {
            key: key.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::EngineUnavailable)
    }

    /// Current phase. Keys never seen are in Baseline.
    pub async fn phase(&self, key: &SourceKey) -> Phase {
        self.shared
            .snapshots
            .read()
            .await
            .get(key)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, key: &SourceKey) -> Option<SelectionState> {
        self.shared.snapshots.read().await.get(key).cloned()
    }

    /// All known keys, ordered by key.
    pub async fn snapshots(&self) -> Vec<SelectionState> {
        let mut all: Vec<SelectionState> =
            self.shared.snapshots.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Subscribe to phase transitions, demotions and run completions.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    async fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| Error::EngineUnavailable)
    }
}

/// Routes commands to one single-writer worker per source key.
pub struct Engine {
    shared: Arc<Shared>,
    command_rx: mpsc::Receiver<EngineCommand>,
    workers: HashMap<SourceKey, mpsc::Sender<KeyCommand>>,
}

impl Engine {
    pub fn new(config: EngineConfig, stores: Stores) -> Result<(Self, EngineHandle)> {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(1024);

        let shared = Arc::new(Shared {
            validator: EdgeValidator::for_mode(config.edge.clone(), config.mode.as_deref()),
            optimizer: Optimizer::new(config.optimizer.clone())?,
            machine: PhaseMachine::new(config.lifecycle.clone()),
            config,
            stores,
            snapshots: RwLock::new(HashMap::new()),
            events,
        });

        let handle = EngineHandle {
            command_tx,
            shared: shared.clone(),
        };
        let engine = Engine {
            shared,
            command_rx,
            workers: HashMap::new(),
        };
        Ok((engine, handle))
    }

    /// Run the engine. Call from `tokio::spawn`.
    ///
    /// Restores persisted state first; keys that were Optimizing resume
    /// their runs immediately.
    pub async fn run(mut self) {
        self.restore().await;

        let period = Duration::from_secs(self.shared.config.lifecycle.retry_interval_secs.max(1));
        let mut retry = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.dispatch(cmd).await,
                    None => {
                        warn!("Engine command channel closed, shutting down");
                        break;
                    }
                },
                _ = retry.tick() => self.retry_optimizing().await,
            }
        }
    }

    async fn restore(&mut self) {
        let states = match self.shared.stores.selections.load_all().await {
            Ok(states) => states,
            Err(e) => {
                error!(error = %e, "Failed to load selection states; starting empty");
                return;
            }
        };
        info!(keys = states.len(), "Selection states restored");

        let mut resume = Vec::new();
        {
            let mut snapshots = self.shared.snapshots.write().await;
            for state in states {
                if state.phase == Phase::Optimizing {
                    resume.push(state.clone());
                }
                snapshots.insert(state.key.clone(), state);
            }
        }
        for state in resume {
            info!(key = %state.key, "Resuming optimization");
            self.spawn_worker(state);
        }
    }

    async fn dispatch(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Outcome { outcome, reply } => {
                let key = outcome.key.clone();
                match self.worker(&key).await {
                    Ok(tx) => {
                        if let Err(mpsc::error::SendError(KeyCommand::Outcome { reply, .. })) =
                            tx.send(KeyCommand::Outcome { outcome, reply }).await
                        {
                            self.workers.remove(&key);
                            let _ = reply.send(Err(Error::EngineUnavailable));
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            EngineCommand::Select { key, reply } => {
                // Only Live keys have anything to select; avoid spawning workers
                // for keys that were never seen.
                if self.snapshot_phase(&key).await != Some(Phase::Live) {
                    let _ = reply.send(Ok(None));
                    return;
                }
                match self.worker(&key).await {
                    Ok(tx) => {
                        if tx.send(KeyCommand::Select { reply }).await.is_err() {
                            self.workers.remove(&key);
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            EngineCommand::Deactivate { key, reply } => match self.workers.remove(&key) {
                Some(tx) => {
                    if let Err(mpsc::error::SendError(KeyCommand::Deactivate { reply })) =
                        tx.send(KeyCommand::Deactivate { reply }).await
                    {
                        let _ = reply.send(false);
                    }
                }
                None => {
                    let _ = reply.send(false);
                }
            },
        }
    }

    async fn snapshot_phase(&self, key: &SourceKey) -> Option<Phase> {
        self.shared.snapshots.read().await.get(key).map(|s| s.phase)
    }

    /// Sender of the key's worker, spawning it from the stored state if needed.
    async fn worker(&mut self, key: &SourceKey) -> Result<mpsc::Sender<KeyCommand>> {
        if let Some(tx) = self.workers.get(key).filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }
        let state = self
            .shared
            .stores
            .selections
            .load(key)
            .await?
            .unwrap_or_else(|| SelectionState::new(key.clone()));
        Ok(self.spawn_worker(state))
    }

    fn spawn_worker(&mut self, state: SelectionState) -> mpsc::Sender<KeyCommand> {
        let key = state.key.clone();
        let (tx, rx) = mpsc::channel(64);
        let worker = KeyWorker::new(state, self.shared.clone(), rx);
        tokio::spawn(worker.run());
        self.workers.insert(key, tx.clone());
        tx
    }

    async fn retry_optimizing(&mut self) {
        let keys: Vec<SourceKey> = self
            .shared
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.phase == Phase::Optimizing)
            .map(|s| s.key.clone())
            .collect();
        for key in keys {
            match self.worker(&key).await {
                Ok(tx) => {
                    let _ = tx.send(KeyCommand::Retry).await;
                }
                Err(e) => error!(key = %key, error = %e, "Failed to start worker for retry"),
            }
        }
    }
}
