//! Per-asset forecasting tasks
//!
//! `TaskManager` owns the registry of running tasks, at most one per asset id.
//! Each task is a spawned loop that runs the forecast pipeline immediately and
//! then once per period, until it is cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::asset::Asset;
use crate::forecast::ForecastRunner;

/// Cadence of forecast updates for a single asset
pub const FORECAST_PERIOD: Duration = Duration::from_secs(60 * 60);

/// How long `shutdown` waits for ticks in progress before leaving them behind
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shortest period accepted, `tokio::time::interval` rejects zero
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A running task. Cancellation is cooperative: the loop only observes the
/// token while waiting for its next tick, so a tick in progress completes.
struct TaskHandle {
    generation: u64,
    /// Asset state every tick of this task uses
    asset: Asset,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct TaskManager {
    runner: Arc<ForecastRunner>,
    period: Duration,
    tasks: Mutex<HashMap<String, TaskHandle>>,
    /// Incremented on every start, lets observers tell a restart from a no-op
    next_generation: AtomicU64,
}

impl TaskManager {
    pub fn new(runner: Arc<ForecastRunner>, period: Duration) -> Self {
        if period < MIN_PERIOD {
            warn!(
                "Forecast period {:?} is too short, using {:?}",
                period, MIN_PERIOD
            );
        }
        let period = period.max(MIN_PERIOD);

        Self {
            runner,
            period,
            tasks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start forecasting for `asset`. An existing task for the same id is
    /// stopped first.
    ///
    /// Every tick uses the asset state passed in here.
    pub fn start(&self, asset: Asset) {
        let mut tasks = self.lock();
        Self::stop_locked(&mut tasks, &asset.id);
        self.start_locked(&mut tasks, asset);
    }

    /// Stop forecasting for `asset_id`. Returns whether a task was running.
    pub fn stop(&self, asset_id: &str) -> bool {
        Self::stop_locked(&mut self.lock(), asset_id)
    }

    /// Stop then start, as one step with respect to other registry operations
    pub fn restart(&self, asset: Asset) {
        self.start(asset)
    }

    pub fn is_active(&self, asset_id: &str) -> bool {
        self.lock().contains_key(asset_id)
    }

    /// Generation of the task currently registered for `asset_id`
    pub fn generation(&self, asset_id: &str) -> Option<u64> {
        self.lock().get(asset_id).map(|t| t.generation)
    }

    /// Ids of all assets with a running task, sorted
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Asset state the running task for `asset_id` was started with
    pub fn snapshot(&self, asset_id: &str) -> Option<Asset> {
        self.lock().get(asset_id).map(|t| t.asset.clone())
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every task and wait up to `SHUTDOWN_GRACE` for ticks in progress
    /// to finish. Ticks still running after that are detached.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, TaskHandle)> = self.lock().drain().collect();
        for (_, task) in &drained {
            task.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for (asset_id, task) in drained {
            debug!("Waiting for forecast task of asset {} to finish", asset_id);
            match tokio::time::timeout_at(deadline, task.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Forecast task for asset {} ended abnormally: {}", asset_id, e)
                }
                Err(_) => warn!(
                    "Forecast task for asset {} still running after {:?}, detaching",
                    asset_id, SHUTDOWN_GRACE
                ),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_locked(&self, tasks: &mut HashMap<String, TaskHandle>, asset: Asset) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Starting forecast task for producer solar asset {} (generation {})",
            asset.id, generation
        );

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_periodic(
            self.runner.clone(),
            asset.clone(),
            self.period,
            cancel.clone(),
        ));

        tasks.insert(
            asset.id.clone(),
            TaskHandle {
                generation,
                asset,
                cancel,
                join,
            },
        );
    }

    fn stop_locked(tasks: &mut HashMap<String, TaskHandle>, asset_id: &str) -> bool {
        match tasks.remove(asset_id) {
            Some(task) => {
                debug!(
                    "Stopping forecast task for producer solar asset {} (generation {})",
                    asset_id, task.generation
                );
                // Detached: the task exits on its own once it sees the token
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        for task in self.lock().values() {
            task.cancel.cancel();
        }
    }
}

async fn run_periodic(
    runner: Arc<ForecastRunner>,
    asset: Asset,
    period: Duration,
    cancel: CancellationToken,
) {
    // First tick completes immediately
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => runner.run(&asset).await,
        }
    }

    debug!("Forecast task for asset {} stopped", asset.id);
}
