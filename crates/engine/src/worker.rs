//! Single-writer actor owning one key's [`SelectionState`].
//!
//! Every mutation of a key's state happens on its worker task, in command
//! order, so outcome processing and phase transitions never race.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bandit::{Arm, ThompsonSelector};
use common::{
    EngineEvent, Error, Outcome, Phase, Result, RunRecord, RunStatus, SourceKey, Trial,
    TrialLog,
};
use optimizer::{select_candidates, OptimizationResult, ReplayTrade, TrialRecorder};

use crate::lifecycle::{Ingest, Selection, Shared};
use crate::phase::Transition;
use crate::state::{RunSummary, SelectionState};

pub(crate) enum KeyCommand {
    Outcome {
        outcome: Outcome,
        reply: oneshot::Sender<Result<Ingest>>,
    },
    Select {
        reply: oneshot::Sender<Result<Option<Selection>>>,
    },
    Retry,
    Deactivate {
        reply: oneshot::Sender<bool>,
    },
}

/// Result of a background optimization, reported back to the worker.
struct RunFinished {
    run_id: String,
    result: Result<OptimizationResult>,
}

struct RunningOptimization {
    cancel: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

pub(crate) struct KeyWorker {
    key: SourceKey,
    state: SelectionState,
    shared: Arc<Shared>,
    command_rx: mpsc::Receiver<KeyCommand>,
    done_tx: mpsc::Sender<RunFinished>,
    done_rx: mpsc::Receiver<RunFinished>,
    selector: ThompsonSelector,
    running: Option<RunningOptimization>,
    /// Trial id of the arm handed out by the last selection.
    last_selected: Option<u32>,
}

impl KeyWorker {
    pub(crate) fn new(
        state: SelectionState,
        shared: Arc<Shared>,
        command_rx: mpsc::Receiver<KeyCommand>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel(4);
        let selector = ThompsonSelector::new(&shared.config.bandit);
        Self {
            key: state.key.clone(),
            state,
            shared,
            command_rx,
            done_tx,
            done_rx,
            selector,
            running: None,
            last_selected: None,
        }
    }

    /// Run the worker. Call from `tokio::spawn`.
    pub(crate) async fn run(mut self) {
        debug!(key = %self.key, phase = %self.state.phase, "Key worker started");
        self.publish().await;
        if self.state.phase == Phase::Optimizing {
            self.start_optimization();
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(KeyCommand::Outcome { outcome, reply }) => {
                        let result = self.on_outcome(outcome).await;
                        let _ = reply.send(result);
                    }
                    Some(KeyCommand::Select { reply }) => {
                        let _ = reply.send(Ok(self.select()));
                    }
                    Some(KeyCommand::Retry) => {
                        if self.state.phase == Phase::Optimizing && self.running.is_none() {
                            info!(key = %self.key, "Retrying optimization");
                            self.start_optimization();
                        }
                    }
                    Some(KeyCommand::Deactivate { reply }) => {
                        self.cancel_optimization();
                        info!(key = %self.key, "Key deactivated");
                        let _ = reply.send(true);
                        break;
                    }
                    None => {
                        self.cancel_optimization();
                        break;
                    }
                },
                Some(done) = self.done_rx.recv() => {
                    self.on_run_finished(done).await;
                }
            }
        }
    }

    // ─── Outcomes ────────────────────────────────────────────────────────────

    async fn on_outcome(&mut self, outcome: Outcome) -> Result<Ingest> {
        if outcome.key != self.key {
            return Err(Error::Other(format!(
                "outcome {} for {} routed to worker of {}",
                outcome.outcome_id, outcome.key, self.key
            )));
        }

        if !self.shared.stores.outcomes.append_outcome(&outcome).await? {
            debug!(key = %self.key, outcome_id = %outcome.outcome_id, "Duplicate outcome ignored");
            return Ok(Ingest::Duplicate);
        }

        match self.state.phase {
            Phase::Baseline => {
                let outcomes = self.baseline_outcomes().await?;
                let assessment = self.shared.validator.assess(&outcomes);
                let mut next = self.state.clone();
                let transition = self.shared.machine.on_assessment(&mut next, assessment);
                self.commit(next).await?;
                self.announce(transition);
            }
            // Stored; the next run picks it up.
            Phase::Optimizing => {}
            Phase::Live => {
                let win = outcome.is_win();
                let mut next = self.state.clone();
                match self.credited_arm(&next.candidates, &outcome) {
                    Some(i) => next.candidates[i].record(win),
                    None => debug!(
                        key = %self.key,
                        outcome_id = %outcome.outcome_id,
                        "Live outcome matches no candidate; posterior unchanged"
                    ),
                }
                let transition =
                    self.shared
                        .machine
                        .on_live_outcome(&mut next, win, outcome.closed_at);
                self.commit(next).await?;
                self.announce(transition);
            }
        }

        Ok(Ingest::Accepted {
            phase: self.state.phase,
        })
    }

    /// Outcomes that count toward the current Baseline episode.
    async fn baseline_outcomes(&self) -> Result<Vec<Outcome>> {
        let outcomes = self.shared.stores.outcomes.outcomes(&self.key).await?;
        Ok(within_episode(outcomes, self.state.baseline_since))
    }

    /// The arm that produced this trade: the one whose configuration was
    /// applied, or the last one handed out when the feed does not say.
    fn credited_arm(&self, candidates: &[Arm], outcome: &Outcome) -> Option<usize> {
        match &outcome.applied_configuration {
            Some(applied) => candidates.iter().position(|a| &a.config == applied),
            None => self
                .last_selected
                .and_then(|id| candidates.iter().position(|a| a.trial_id == id)),
        }
    }

    // ─── Selection ───────────────────────────────────────────────────────────

    fn select(&mut self) -> Option<Selection> {
        if self.state.phase != Phase::Live {
            return None;
        }
        let arm = self.selector.select(&self.state.candidates)?;
        let chosen = &self.state.candidates[arm];
        self.last_selected = Some(chosen.trial_id);
        Some(Selection {
            key: self.key.clone(),
            arm,
            trial_id: chosen.trial_id,
            config: chosen.config,
        })
    }

    // ─── Optimization ────────────────────────────────────────────────────────

    fn start_optimization(&mut self) {
        if self.running.is_some() {
            return;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let key = self.key.clone();
        let baseline_since = self.state.baseline_since;
        let done_tx = self.done_tx.clone();
        let flag = cancel.clone();

        let task = tokio::spawn(async move {
            let done = optimize(shared, key, baseline_since, flag).await;
            let _ = done_tx.send(done).await;
        });
        self.running = Some(RunningOptimization {
            cancel,
            _task: task,
        });
    }

    fn cancel_optimization(&mut self) {
        if let Some(run) = self.running.take() {
            info!(key = %self.key, "Cancelling in-flight optimization");
            run.cancel.store(true, Ordering::Relaxed);
        }
    }

    async fn on_run_finished(&mut self, done: RunFinished) {
        self.running = None;
        let RunFinished { run_id, result } = done;

        if self.state.phase != Phase::Optimizing {
            warn!(key = %self.key, %run_id, phase = %self.state.phase, "Discarding run result");
            return;
        }

        let mut next = self.state.clone();
        let (event, transition) = match result {
            Ok(result) if result.status == RunStatus::Cancelled => {
                info!(key = %self.key, %run_id, "Optimization cancelled; state untouched");
                return;
            }
            Ok(result) => {
                // Feed time of the newest outcome; a hard demotion restarts Baseline after it.
                let episode_end = match self.shared.stores.outcomes.outcomes(&self.key).await {
                    Ok(outcomes) => outcomes.last().map(|o| o.closed_at),
                    Err(e) => {
                        error!(key = %self.key, %run_id, error = %e, "Failed to read outcomes; run result not applied");
                        return;
                    }
                };
                let candidates = select_candidates(&result.front);
                let arms: Vec<Arm> = candidates
                    .iter()
                    .map(|c| Arm::new(c.point.trial_id, c.point.config, c.point.objectives))
                    .collect();
                let event = EngineEvent::OptimizationCompleted {
                    key: self.key.clone(),
                    run_id: run_id.clone(),
                    status: result.status,
                    trials: result.trials.len(),
                    front_size: result.front.len(),
                    candidates: arms.len(),
                };
                next.last_run = Some(RunSummary {
                    run_id,
                    status: result.status,
                    trials: result.trials.len(),
                    front_size: result.front.len(),
                    error: None,
                    finished_at: Utc::now(),
                });
                (
                    event,
                    self.shared.machine.on_candidates(&mut next, arms, episode_end),
                )
            }
            Err(e) => {
                warn!(key = %self.key, %run_id, error = %e, "Optimization failed; staying in Optimizing");
                let event = EngineEvent::OptimizationFailed {
                    key: self.key.clone(),
                    run_id: run_id.clone(),
                    reason: e.to_string(),
                };
                next.last_run = Some(RunSummary {
                    run_id,
                    status: RunStatus::Failed,
                    trials: 0,
                    front_size: 0,
                    error: Some(e.to_string()),
                    finished_at: Utc::now(),
                });
                (event, None)
            }
        };

        let committed = self.commit(next).await;
        self.emit(event);
        match committed {
            Ok(()) => self.announce(transition),
            Err(e) => error!(key = %self.key, error = %e, "Optimization result not applied"),
        }
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Persist `next` and adopt it. On failure the in-memory state is
    /// re-read from the store.
    async fn commit(&mut self, mut next: SelectionState) -> Result<()> {
        next.updated_at = Utc::now();
        match self.shared.stores.selections.save(&next).await {
            Ok(version) => {
                next.version = version;
                self.state = next;
                self.publish().await;
                Ok(())
            }
            Err(e) => {
                error!(key = %self.key, version = next.version, error = %e, "Failed to persist selection state");
                match self.shared.stores.selections.load(&self.key).await {
                    Ok(Some(stored)) => {
                        self.state = stored;
                        self.publish().await;
                    }
                    Ok(None) => {}
                    Err(load_err) => {
                        error!(key = %self.key, error = %load_err, "Failed to reload selection state")
                    }
                }
                Err(e)
            }
        }
    }

    /// Emit a committed transition and start a run on entering Optimizing.
    fn announce(&mut self, transition: Option<Transition>) {
        let Some(t) = transition else {
            return;
        };
        let to = t.to();
        self.emit(t.into_event(self.key.clone()));
        if to == Phase::Optimizing {
            self.start_optimization();
        }
    }

    async fn publish(&self) {
        self.shared
            .snapshots
            .write()
            .await
            .insert(self.key.clone(), self.state.clone());
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }
}

/// Outcomes closed strictly after `since`, the feed time that ended the
/// previous episode.
fn within_episode(outcomes: Vec<Outcome>, since: Option<DateTime<Utc>>) -> Vec<Outcome> {
    match since {
        Some(t) => outcomes.into_iter().filter(|o| o.closed_at > t).collect(),
        None => outcomes,
    }
}

// ─── Background run ──────────────────────────────────────────────────────────

/// Commits each trial to the trial log before the optimizer moves on.
/// Runs on the blocking thread that drives the optimizer.
struct LogRecorder {
    log: Arc<dyn TrialLog>,
    key: SourceKey,
    run_id: String,
    runtime: tokio::runtime::Handle,
}

impl TrialRecorder for LogRecorder {
    fn record(&mut self, trial: &Trial) -> Result<()> {
        self.runtime
            .block_on(self.log.append_trial(&self.key, &self.run_id, trial))
    }
}

/// Open (or resume) a run, optimize, and close the run with its final status.
async fn optimize(
    shared: Arc<Shared>,
    key: SourceKey,
    since_time: Option<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
) -> RunFinished {
    let seed = shared.config.optimizer.seed.unwrap_or_else(rand::random);
    let record = match shared.stores.trials.open_run(&key, seed).await {
        Ok(record) => record,
        Err(e) => {
            error!(key = %key, error = %e, "Failed to open optimization run");
            return RunFinished {
                run_id: String::new(),
                result: Err(e),
            };
        }
    };
    info!(key = %key, run_id = %record.run_id, seed = record.seed, resumed = record.resumed, "Optimization run opened");

    let result = execute(&shared, &key, &record, since_time, cancel).await;
    let status = match &result {
        Ok(r) => r.status,
        Err(_) => RunStatus::Failed,
    };
    if let Err(e) = shared.stores.trials.close_run(&key, &record.run_id, status).await {
        error!(key = %key, run_id = %record.run_id, error = %e, "Failed to close optimization run");
    }

    RunFinished {
        run_id: record.run_id,
        result,
    }
}

async fn execute(
    shared: &Shared,
    key: &SourceKey,
    record: &RunRecord,
    since_time: Option<DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
) -> Result<OptimizationResult> {
    let trades = replay_trades(shared, key, since_time).await?;
    if trades.is_empty() {
        return Err(Error::DegenerateSearchSpace(
            "no outcome has a replayable price path".into(),
        ));
    }

    let prior = if record.resumed {
        shared.stores.trials.trials(key, &record.run_id).await?
    } else {
        Vec::new()
    };

    let optimizer = shared.optimizer.clone();
    let mut recorder = LogRecorder {
        log: shared.stores.trials.clone(),
        key: key.clone(),
        run_id: record.run_id.clone(),
        runtime: tokio::runtime::Handle::current(),
    };
    let seed = record.seed;

    tokio::task::spawn_blocking(move || optimizer.run(&trades, seed, &prior, &mut recorder, &cancel))
        .await
        .map_err(|e| Error::Other(format!("optimization task failed: {e}")))?
}

/// Most recent outcomes of the key paired with their price paths. Outcomes
/// without a stored path are skipped.
async fn replay_trades(
    shared: &Shared,
    key: &SourceKey,
    since_time: Option<DateTime<Utc>>,
) -> Result<Vec<ReplayTrade>> {
    let outcomes = within_episode(shared.stores.outcomes.outcomes(key).await?, since_time);
    let window = shared.config.optimizer.window.max(1);
    let recent = &outcomes[outcomes.len().saturating_sub(window)..];

    let mut trades = Vec::with_capacity(recent.len());
    let mut missing = 0usize;
    for outcome in recent {
        match shared.stores.paths.price_path(&outcome.outcome_id).await? {
            Some(path) => trades.push(ReplayTrade::new(outcome, path)),
            None => missing += 1,
        }
    }
    if missing > 0 {
        warn!(key = %key, missing, replayable = trades.len(), "Outcomes without price path skipped");
    }
    Ok(trades)
}
