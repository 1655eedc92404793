//! Background timers owned by the process: the certificate sweep and the
//! rate-limit window reset.
use crate::gateway::RateLimiter;
use crate::lifecycle::CertificateLifecycleManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// `tokio::time::interval` panics on a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Owns the background tasks and stops them on [`Scheduler::shutdown`].
#[derive(Debug)]
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn both tasks on the current runtime.
    pub fn start(
        lifecycle: Arc<CertificateLifecycleManager>,
        sweep_interval: Duration,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(sweep_task(
            lifecycle,
            sweep_interval,
            signal.clone(),
        ))];
        if limiter.is_enabled() {
            tasks.push(tokio::spawn(window_reset_task(limiter, signal)));
        }
        info!(tasks = tasks.len(), "scheduler started");
        Self { shutdown, tasks }
    }

    /// Signal every task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

async fn sweep_task(
    lifecycle: Arc<CertificateLifecycleManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = lifecycle.sweep(Utc::now());
                if !report.failed.is_empty() {
                    warn!(failed = report.failed.len(), "certificate sweep had failures");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("sweep task stopped");
}

async fn window_reset_task(limiter: Arc<RateLimiter>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(limiter.window().max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; the initial window is already fresh.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.reset(),
            _ = shutdown.changed() => break,
        }
    }
    debug!("rate limit reset task stopped");
}
