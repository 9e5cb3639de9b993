// ========== Background Manager ==========

use async_trait::async_trait;
use log::{debug, error, warn};
use stager_lib::StagerResult;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackgroundTaskKind {
    SubRequestDispatch,
    RequestDispatch,
    TapeMountPoll,
    MigrationSelect,
    RequestCleanup,
}

impl BackgroundTaskKind {
    fn all() -> [BackgroundTaskKind; 5] {
        [
            BackgroundTaskKind::SubRequestDispatch,
            BackgroundTaskKind::RequestDispatch,
            BackgroundTaskKind::TapeMountPoll,
            BackgroundTaskKind::MigrationSelect,
            BackgroundTaskKind::RequestCleanup,
        ]
    }
}

/// A recurring unit of work. `target` names what the task is about (a service class for
/// migration selection) and is empty for global loops.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackgroundTask {
    pub kind: BackgroundTaskKind,
    pub target: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePushMode {
    Front,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackgroundTaskPolicy {
    /// How often this kind of task should be attempted.
    pub interval: Duration,
    /// Max cumulative execution time in one sweep.
    pub max_run_time: Duration,
}

impl BackgroundTaskPolicy {
    pub fn new(interval: Duration, max_run_time: Duration) -> Self {
        Self {
            interval,
            max_run_time,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BackgroundRunStats {
    pub executed: usize,
    pub failed: usize,
    pub skipped_due_to_budget: usize,
}

#[async_trait]
pub trait BackgroundTaskExecutor: Send + Sync {
    /// Runs one step of the task. `Ok(true)` means work was done and the task may be
    /// called again in the same sweep.
    async fn execute(&self, task: &BackgroundTask) -> StagerResult<bool>;
}

#[derive(Default)]
struct TaskQueue {
    items: VecDeque<BackgroundTask>,
    dedup: HashSet<BackgroundTask>,
}

impl TaskQueue {
    fn push(&mut self, task: BackgroundTask, mode: QueuePushMode) {
        if self.dedup.contains(&task) {
            if let Some(pos) = self.items.iter().position(|t| t == &task) {
                let _ = self.items.remove(pos);
            }
        } else {
            let _ = self.dedup.insert(task.clone());
        }

        match mode {
            QueuePushMode::Front => self.items.push_front(task),
            QueuePushMode::Back => self.items.push_back(task),
        }
    }

    fn remove(&mut self, task: &BackgroundTask) -> bool {
        if !self.dedup.remove(task) {
            return false;
        }
        self.items.retain(|t| t != task);
        true
    }

    fn snapshot(&self) -> Vec<BackgroundTask> {
        self.items.iter().cloned().collect()
    }
}

/// Recurring tasks grouped by kind. Tasks stay registered across sweeps; each due kind
/// runs its tasks in queue order within the kind's time budget.
pub struct BackgroundMgr {
    queues: HashMap<BackgroundTaskKind, TaskQueue>,
    policies: HashMap<BackgroundTaskKind, BackgroundTaskPolicy>,
    last_attempt_at: HashMap<BackgroundTaskKind, Instant>,
}

impl BackgroundMgr {
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        let mut policies = HashMap::new();

        for kind in BackgroundTaskKind::all() {
            queues.insert(kind, TaskQueue::default());
            policies.insert(
                kind,
                BackgroundTaskPolicy::new(Duration::from_secs(5), Duration::from_secs(2)),
            );
        }

        Self {
            queues,
            policies,
            last_attempt_at: HashMap::new(),
        }
    }

    fn queue_mut(&mut self, kind: BackgroundTaskKind) -> &mut TaskQueue {
        self.queues.entry(kind).or_default()
    }

    fn queue_ref(&self, kind: BackgroundTaskKind) -> Option<&TaskQueue> {
        self.queues.get(&kind)
    }

    pub fn set_policy(&mut self, kind: BackgroundTaskKind, policy: BackgroundTaskPolicy) {
        self.policies.insert(kind, policy);
    }

    pub fn policy(&self, kind: BackgroundTaskKind) -> Option<BackgroundTaskPolicy> {
        self.policies.get(&kind).copied()
    }

    pub fn push_task(&mut self, task: BackgroundTask, mode: QueuePushMode) {
        self.queue_mut(task.kind).push(task, mode);
    }

    pub fn push_back(&mut self, kind: BackgroundTaskKind, target: impl Into<String>) {
        self.push_task(
            BackgroundTask {
                kind,
                target: target.into(),
            },
            QueuePushMode::Back,
        );
    }

    pub fn push_front(&mut self, kind: BackgroundTaskKind, target: impl Into<String>) {
        self.push_task(
            BackgroundTask {
                kind,
                target: target.into(),
            },
            QueuePushMode::Front,
        );
    }

    pub fn remove_task(&mut self, task: &BackgroundTask) -> bool {
        self.queue_mut(task.kind).remove(task)
    }

    pub fn tasks(&self, kind: BackgroundTaskKind) -> Vec<BackgroundTask> {
        self.queue_ref(kind).map(|q| q.snapshot()).unwrap_or_default()
    }

    /// A kind never attempted is due right away.
    fn take_due_kinds(&mut self, now: Instant) -> Vec<(BackgroundTaskKind, BackgroundTaskPolicy)> {
        let mut due = Vec::new();
        for kind in BackgroundTaskKind::all() {
            let Some(policy) = self.policies.get(&kind).copied() else {
                continue;
            };
            if let Some(last) = self.last_attempt_at.get(&kind).copied() {
                if now.duration_since(last) < policy.interval {
                    continue;
                }
            }
            self.last_attempt_at.insert(kind, now);
            due.push((kind, policy));
        }
        due
    }

    pub async fn run_once(
        mgr: &Arc<Mutex<BackgroundMgr>>,
        executor: &(dyn BackgroundTaskExecutor + Send + Sync),
    ) -> BackgroundRunStats {
        let due = {
            match mgr.lock() {
                Ok(mut guard) => guard
                    .take_due_kinds(Instant::now())
                    .into_iter()
                    .map(|(kind, policy)| (policy, guard.tasks(kind)))
                    .collect::<Vec<_>>(),
                Err(e) => {
                    error!(
                        "background run_once: lock poisoned while taking due kinds: {}",
                        e
                    );
                    return BackgroundRunStats::default();
                }
            }
        };

        let mut stats = BackgroundRunStats::default();
        for (policy, tasks) in due {
            let sweep_started = Instant::now();
            for (idx, task) in tasks.iter().enumerate() {
                if sweep_started.elapsed() >= policy.max_run_time {
                    stats.skipped_due_to_budget += tasks.len() - idx;
                    break;
                }
                loop {
                    let started = Instant::now();
                    match executor.execute(task).await {
                        Ok(more) => {
                            stats.executed += 1;
                            debug!(
                                "background task step: kind={:?}, target={}, more={}, elapsed={:?}",
                                task.kind,
                                task.target,
                                more,
                                started.elapsed()
                            );
                            if !more {
                                break;
                            }
                        }
                        Err(e) => {
                            stats.failed += 1;
                            warn!(
                                "background task failed: kind={:?}, target={}, elapsed={:?}, err_code={}, err={}",
                                task.kind,
                                task.target,
                                started.elapsed(),
                                e.errno(),
                                e
                            );
                            break;
                        }
                    }
                    if sweep_started.elapsed() >= policy.max_run_time {
                        break;
                    }
                }
            }
        }

        stats
    }

    pub fn spawn_worker(
        mgr: Arc<Mutex<BackgroundMgr>>,
        executor: Arc<dyn BackgroundTaskExecutor + Send + Sync>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = Self::run_once(&mgr, executor.as_ref()).await;
            }
        })
    }
}

impl Default for BackgroundMgr {
    fn default() -> Self {
        Self::new()
    }
}
