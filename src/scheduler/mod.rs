//! Convoy execution engine.
//!
//! The scheduler dispatches convoy members through the admission layer
//! (backpressure slot + rate-limit token per member), fans them out over a
//! `JoinSet` bounded by a resource-adaptive concurrency limit, and settles
//! each member at its boundary: handler errors, admission failures, and
//! persistence-flush failures all become failed members, never engine
//! crashes. The limit is re-evaluated mid-flight at a fixed interval so a
//! long run reacts to changing load.

pub(crate) mod events;
mod handler;

pub use events::ConvoyEvent;
pub use handler::{Handler, HandlerContext};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::admission::{Backpressure, RateLimiter};
use crate::config::SchedulerConfig;
use crate::domain::{
    AutoTuningPolicy, Convoy, ConvoyProgress, ConvoyStatus, MemberStatus, WorkItemStatus,
};
use crate::error::{ConvoyError, Result};
use crate::monitor::ResourceMonitor;
use crate::scheduler::events::EventSink;
use crate::store::WorkItemStore;

/// Blueprint for a new convoy.
#[derive(Debug, Clone)]
pub struct ConvoySpec {
    pub name: String,
    pub description: String,
    /// `(handler_id, work_item_id)` pairs in dispatch order.
    pub members: Vec<(String, String)>,
    pub max_parallel: usize,
    pub auto_tuning: AutoTuningPolicy,
    pub stop_on_first_failure: bool,
    pub issue_ref: Option<i64>,
}

impl Default for ConvoySpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            members: Vec::new(),
            max_parallel: 4,
            auto_tuning: AutoTuningPolicy::default(),
            stop_on_first_failure: false,
            issue_ref: None,
        }
    }
}

/// Outcome of one task in direct-task mode.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub handler_id: String,
    pub work_item_id: String,
    pub status: MemberStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Summary of a direct-task run.
#[derive(Debug, Clone)]
pub struct TaskRunSummary {
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<TaskOutcome>,
}

/// Terminal record for one dispatched slot.
#[derive(Debug, Clone)]
struct SlotOutcome {
    status: MemberStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

impl SlotOutcome {
    fn pending() -> Self {
        Self {
            status: MemberStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// Resource-adaptive convoy scheduler.
pub struct ConvoyScheduler {
    monitor: Arc<ResourceMonitor>,
    backpressure: Arc<Backpressure>,
    rate_limiter: Arc<RateLimiter>,
    config: SchedulerConfig,
    store: Option<Arc<WorkItemStore>>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    convoys: Mutex<HashMap<String, Convoy>>,
    events: EventSink,
}

impl ConvoyScheduler {
    /// Create a scheduler over the given admission and monitoring services.
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        backpressure: Arc<Backpressure>,
        rate_limiter: Arc<RateLimiter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            monitor,
            backpressure,
            rate_limiter,
            config,
            store: None,
            handlers: RwLock::new(HashMap::new()),
            convoys: Mutex::new(HashMap::new()),
            events: EventSink::default(),
        }
    }

    /// Attach a work-item store; member outcomes are flushed into it.
    pub fn with_store(mut self, store: Arc<WorkItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a telemetry sink; events are sent best-effort, never blocking.
    pub fn with_event_sink(mut self, tx: mpsc::Sender<ConvoyEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Register a handler under an id; replaces any previous registration.
    pub fn register_handler(&self, id: &str, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), handler);
    }

    fn handler(&self, id: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Build a pending convoy and return its id.
    pub fn create_convoy(&self, spec: ConvoySpec) -> String {
        let mut convoy = Convoy::new(&spec.name, &spec.description, &spec.members);
        convoy.max_parallel = spec.max_parallel.max(1);
        convoy.auto_tuning = spec.auto_tuning;
        convoy.stop_on_first_failure = spec.stop_on_first_failure;
        convoy.issue_ref = spec.issue_ref;

        let id = convoy.id.clone();
        tracing::info!(
            convoy_id = %id,
            name = %convoy.name,
            members = convoy.members.len(),
            "convoy created"
        );
        self.convoys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), convoy);
        id
    }

    /// Fetch a convoy by id.
    pub fn get_convoy(&self, id: &str) -> Option<Convoy> {
        self.convoys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// List convoys, optionally filtered by status, oldest first.
    pub fn list_convoys(&self, status: Option<ConvoyStatus>) -> Vec<Convoy> {
        let convoys = self.convoys.lock().unwrap_or_else(|p| p.into_inner());
        let mut listed: Vec<Convoy> = convoys
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        listed
    }

    /// Progress report for one convoy.
    pub fn progress(&self, id: &str) -> Result<ConvoyProgress> {
        self.get_convoy(id)
            .map(|c| c.progress())
            .ok_or_else(|| ConvoyError::ConvoyNotFound(id.to_string()))
    }

    /// Execute a pending convoy to its terminal status.
    ///
    /// `caller` is the rate-limit identity charged for each member dispatch.
    pub async fn execute(&self, convoy_id: &str, caller: &str) -> Result<ConvoyStatus> {
        let (pairs, max_parallel, tuning, stop_fast) = {
            let mut convoys = self.convoys.lock().unwrap_or_else(|p| p.into_inner());
            let convoy = convoys
                .get_mut(convoy_id)
                .ok_or_else(|| ConvoyError::ConvoyNotFound(convoy_id.to_string()))?;
            if convoy.status != ConvoyStatus::Pending {
                return Err(ConvoyError::InvalidState(format!(
                    "convoy '{}' is {}, expected pending",
                    convoy_id, convoy.status
                )));
            }
            convoy.status = ConvoyStatus::Running;
            convoy.touch();

            let pairs: Vec<(String, String)> = convoy
                .members
                .iter()
                .map(|m| (m.handler_id.clone(), m.work_item_id.clone()))
                .collect();
            (
                pairs,
                convoy.max_parallel,
                convoy.auto_tuning.clone(),
                convoy.stop_on_first_failure,
            )
        };

        tracing::info!(
            convoy_id = %convoy_id,
            members = pairs.len(),
            max_parallel = max_parallel,
            auto_tuning = tuning.enabled,
            "convoy execution started"
        );
        self.events.emit(ConvoyEvent::ConvoyStarted {
            convoy_id: convoy_id.to_string(),
            total: pairs.len(),
        });

        let tuning_opt = tuning.enabled.then(|| tuning.clone());
        let (_outcomes, stopped_early) = self
            .run_batch(Some(convoy_id), &pairs, caller, max_parallel, tuning_opt, stop_fast)
            .await;

        let (final_status, progress) = {
            let mut convoys = self.convoys.lock().unwrap_or_else(|p| p.into_inner());
            let convoy = convoys
                .get_mut(convoy_id)
                .ok_or_else(|| ConvoyError::ConvoyNotFound(convoy_id.to_string()))?;
            let status = convoy.final_status(stopped_early);
            convoy.status = status;
            convoy.touch();
            (status, convoy.progress())
        };

        tracing::info!(
            convoy_id = %convoy_id,
            status = %final_status,
            completed = progress.completed,
            failed = progress.failed,
            pending = progress.pending,
            "convoy execution finished"
        );
        self.events.emit(ConvoyEvent::ConvoyFinished {
            convoy_id: convoy_id.to_string(),
            status: final_status,
            progress,
        });

        Ok(final_status)
    }

    /// Run `(handler_id, work_item_id)` tasks with a fixed parallelism
    /// ceiling, no convoy bookkeeping.
    pub async fn run_tasks(
        &self,
        tasks: Vec<(String, String)>,
        caller: &str,
        max_parallel: usize,
    ) -> TaskRunSummary {
        let (outcomes, _) = self
            .run_batch(None, &tasks, caller, max_parallel.max(1), None, false)
            .await;

        let mut summary = TaskRunSummary {
            completed: 0,
            failed: 0,
            results: Vec::with_capacity(tasks.len()),
        };
        for (outcome, (handler_id, work_item_id)) in outcomes.into_iter().zip(tasks) {
            match outcome.status {
                MemberStatus::Completed => summary.completed += 1,
                _ => summary.failed += 1,
            }
            summary.results.push(TaskOutcome {
                handler_id,
                work_item_id,
                status: outcome.status,
                result: outcome.result,
                error: outcome.error,
            });
        }
        summary
    }

    /// Current concurrency limit, never below 1.
    fn concurrency_limit(&self, max_parallel: usize, tuning: Option<&AutoTuningPolicy>) -> usize {
        let Some(tuning) = tuning else {
            return max_parallel.max(1);
        };

        let mut limit = self.monitor.optimal_parallelism(
            max_parallel,
            tuning.baseline_parallel,
            tuning.cpu_weight,
            tuning.memory_weight,
        );
        if self
            .monitor
            .should_throttle(tuning.cpu_threshold, tuning.memory_threshold)
        {
            let factor = self
                .monitor
                .throttle_factor(tuning.cpu_threshold, tuning.memory_threshold);
            limit = (limit as f64 * factor).floor() as usize;
        }
        limit.max(1)
    }

    /// Dispatch a batch through admission and the bounded `JoinSet`.
    ///
    /// Returns per-slot outcomes in input order and whether the run stopped
    /// before dispatching every slot.
    async fn run_batch(
        &self,
        convoy_id: Option<&str>,
        pairs: &[(String, String)],
        caller: &str,
        max_parallel: usize,
        tuning: Option<AutoTuningPolicy>,
        stop_on_first_failure: bool,
    ) -> (Vec<SlotOutcome>, bool) {
        let total = pairs.len();
        let mut outcomes = vec![SlotOutcome::pending(); total];
        let mut join_set: JoinSet<(usize, std::result::Result<serde_json::Value, String>)> =
            JoinSet::new();
        let mut in_flight = 0usize;
        let mut next = 0usize;
        let mut stopped_early = false;

        let adaptive = tuning.is_some();
        let retune = self.config.retune_interval();
        let mut limit = self.concurrency_limit(max_parallel, tuning.as_ref());
        let mut last_retune = Instant::now();

        'run: while next < total || in_flight > 0 {
            if adaptive && last_retune.elapsed() >= retune {
                let new_limit = self.concurrency_limit(max_parallel, tuning.as_ref());
                if new_limit != limit {
                    tracing::info!(
                        old_limit = limit,
                        new_limit = new_limit,
                        "concurrency limit retuned"
                    );
                    limit = new_limit;
                }
                last_retune = Instant::now();
            }

            while !stopped_early && next < total && in_flight < limit {
                let index = next;
                next += 1;
                let (handler_id, work_item_id) = pairs[index].clone();

                let Some(handler) = self.handler(&handler_id) else {
                    let err = ConvoyError::UnknownHandler(handler_id.clone());
                    outcomes[index] = self
                        .settle(convoy_id, &handler_id, &work_item_id, index, Err(err.to_string()))
                        .await;
                    if stop_on_first_failure {
                        stopped_early = true;
                    }
                    continue;
                };

                let admitted = match self
                    .backpressure
                    .acquire(Some(self.config.admission_timeout()))
                    .await
                {
                    Ok(guard) => match self.rate_limiter.acquire(caller).await {
                        Ok(()) => Ok(guard),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                let guard = match admitted {
                    Ok(guard) => guard,
                    Err(e) => {
                        outcomes[index] = self
                            .settle(convoy_id, &handler_id, &work_item_id, index, Err(e.to_string()))
                            .await;
                        if stop_on_first_failure {
                            stopped_early = true;
                        }
                        continue;
                    }
                };

                self.mark_running(convoy_id, index, &handler_id, &work_item_id);
                let ctx = HandlerContext {
                    caller: caller.to_string(),
                    convoy_id: convoy_id.map(str::to_string),
                    store: self.store.clone(),
                };
                join_set.spawn(async move {
                    let result = handler
                        .execute(&work_item_id, &ctx)
                        .await
                        .map_err(|e| e.to_string());
                    drop(guard);
                    (index, result)
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                if stopped_early || next >= total {
                    break 'run;
                }
                continue;
            }

            let sleep_for = retune.saturating_sub(last_retune.elapsed());
            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((index, result))) => {
                            in_flight -= 1;
                            let (handler_id, work_item_id) = &pairs[index];
                            outcomes[index] = self
                                .settle(convoy_id, handler_id, work_item_id, index, result)
                                .await;
                            if outcomes[index].status == MemberStatus::Failed && stop_on_first_failure {
                                stopped_early = true;
                            }
                        }
                        Some(Err(e)) => {
                            in_flight -= 1;
                            tracing::error!(error = ?e, "member task panicked");
                        }
                        None => {}
                    }
                }
                _ = tokio::time::sleep(sleep_for), if adaptive => {}
            }
        }

        // A panicked task leaves its slot unsettled; record the failure.
        for index in 0..next {
            if outcomes[index].status == MemberStatus::Pending {
                let (handler_id, work_item_id) = &pairs[index];
                outcomes[index] = self
                    .settle(
                        convoy_id,
                        handler_id,
                        work_item_id,
                        index,
                        Err("member task panicked".to_string()),
                    )
                    .await;
            }
        }

        (outcomes, stopped_early)
    }

    /// Settle one slot: persist the work-item status, record the member
    /// state, and emit telemetry. A flush failure flips the slot to failed.
    async fn settle(
        &self,
        convoy_id: Option<&str>,
        handler_id: &str,
        work_item_id: &str,
        index: usize,
        result: std::result::Result<serde_json::Value, String>,
    ) -> SlotOutcome {
        let mut outcome = match result {
            Ok(value) => SlotOutcome {
                status: MemberStatus::Completed,
                result: Some(value),
                error: None,
            },
            Err(error) => SlotOutcome {
                status: MemberStatus::Failed,
                result: None,
                error: Some(error),
            },
        };

        if let Some(convoy_id) = convoy_id {
            let target = match outcome.status {
                MemberStatus::Completed => WorkItemStatus::Completed,
                _ => WorkItemStatus::Failed,
            };
            if let Err(e) = self.flush_item_status(work_item_id, target).await {
                tracing::warn!(
                    work_item_id = %work_item_id,
                    error = %e,
                    "work item status flush failed"
                );
                outcome.status = MemberStatus::Failed;
                outcome.error = Some(format!("persistence flush failed: {}", e));
            }

            {
                let mut convoys = self.convoys.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(convoy) = convoys.get_mut(convoy_id) {
                    if let Some(member) = convoy.members.get_mut(index) {
                        member.status = outcome.status;
                        member.error = outcome.error.clone();
                        member.result = outcome.result.clone();
                    }
                    convoy.touch();
                }
            }

            self.events.emit(ConvoyEvent::MemberFinished {
                convoy_id: convoy_id.to_string(),
                handler_id: handler_id.to_string(),
                work_item_id: work_item_id.to_string(),
                status: outcome.status,
                error: outcome.error.clone(),
            });
        }

        match outcome.status {
            MemberStatus::Completed => tracing::info!(
                handler_id = %handler_id,
                work_item_id = %work_item_id,
                "member completed"
            ),
            _ => tracing::warn!(
                handler_id = %handler_id,
                work_item_id = %work_item_id,
                error = outcome.error.as_deref().unwrap_or(""),
                "member failed"
            ),
        }

        outcome
    }

    fn mark_running(
        &self,
        convoy_id: Option<&str>,
        index: usize,
        handler_id: &str,
        work_item_id: &str,
    ) {
        let Some(convoy_id) = convoy_id else {
            return;
        };

        {
            let mut convoys = self.convoys.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(convoy) = convoys.get_mut(convoy_id) {
                if let Some(member) = convoy.members.get_mut(index) {
                    member.status = MemberStatus::Running;
                }
            }
        }
        self.events.emit(ConvoyEvent::MemberStarted {
            convoy_id: convoy_id.to_string(),
            handler_id: handler_id.to_string(),
            work_item_id: work_item_id.to_string(),
        });
    }

    /// Flush a work item's status under optimistic locking with bounded
    /// re-read-and-retry.
    async fn flush_item_status(&self, work_item_id: &str, status: WorkItemStatus) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        if !self.config.persist_results {
            return Ok(());
        }

        let retries = self.config.flush_retries;
        let id = work_item_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut attempt = 0;
            loop {
                let mut item = store
                    .get(&id)?
                    .ok_or_else(|| ConvoyError::ItemNotFound(id.clone()))?;
                item.status = status;
                match store.update(&item, item.version) {
                    Ok(_) => return Ok(()),
                    Err(ConvoyError::ConcurrentUpdate { .. }) if attempt < retries => {
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|e| ConvoyError::Handler(format!("flush task aborted: {}", e)))?
    }
}
