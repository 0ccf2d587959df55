//! Scheduler: supervised background loops
//!
//! Two long-lived workers (the limit-settlement tick and the prune sweep)
//! run on their own tasks. A worker that panics is restarted after a short
//! delay; both observe a shared shutdown signal between iterations, so
//! stopping completes within one loop interval.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::engine::Engine;

const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Tick,
    Prune,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Tick => "tick",
            Job::Prune => "prune",
        }
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Spawn the background loops. `prune_every_min == 0` disables the
    /// prune worker.
    pub fn start(
        engine: Engine,
        config: &SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerHandle {
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(supervise(
            engine.clone(),
            Job::Tick,
            Duration::from_secs(config.tick_loop_sec),
            shutdown.clone(),
        )));
        if config.prune_every_min > 0 {
            tasks.push(tokio::spawn(supervise(
                engine,
                Job::Prune,
                Duration::from_secs(config.prune_every_min * 60),
                shutdown,
            )));
        }
        SchedulerHandle { tasks }
    }
}

pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Wait for every worker to observe shutdown and finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task join failed");
            }
        }
    }
}

/// Restart-on-panic supervisor. A clean worker exit means shutdown was
/// observed; a join error means the worker died and gets respawned.
async fn supervise(engine: Engine, job: Job, every: Duration, shutdown: watch::Receiver<bool>) {
    loop {
        let worker = tokio::spawn(worker_loop(
            engine.clone(),
            job,
            every,
            shutdown.clone(),
        ));
        match worker.await {
            Ok(()) => return,
            Err(e) => {
                error!(job = job.name(), error = %e, "worker died; restarting");
                if *shutdown.borrow() {
                    return;
                }
                tokio::time::sleep(RESTART_DELAY).await;
            }
        }
    }
}

async fn worker_loop(
    engine: Engine,
    job: Job,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(job = job.name(), every_secs = every.as_secs(), "background loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => match job {
                Job::Tick => match engine.settle_open_limit_orders().await {
                    Ok(0) => debug!("tick sweep: nothing to settle"),
                    Ok(n) => info!(settled = n, "tick sweep"),
                    Err(e) => error!(error = %e, "tick sweep failed"),
                },
                Job::Prune => match engine.prune().await {
                    Ok(stats) => debug!(%stats, "prune sweep"),
                    Err(e) => error!(error = %e, "prune sweep failed"),
                },
            },
            _ = shutdown.changed() => {
                info!(job = job.name(), "background loop stopping");
                return;
            }
        }
    }
}
