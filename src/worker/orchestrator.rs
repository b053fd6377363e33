//! Orchestrator: runs the loops in a fixed cycle and sleeps between cycles.
//!
//! Cycle order: initiation, then the drain of every configured channel, then
//! the timeout sweep. Each step runs to exhaustion. A store error ends the
//! step it happened in; the cycle continues with the next step and the
//! failed one is retried on the next tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::channels::Channel;
use crate::pipeline::drain::{DrainReport, InboxDrain};
use crate::store::Database;
use crate::worker::initiation::OutreachInitiation;
use crate::worker::timeout_sweep::TimeoutSweep;

/// Outcome of one full cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub contacted: usize,
    pub drained: Vec<(Channel, DrainReport)>,
    pub reminded: usize,
    /// Steps that failed on a store error.
    pub failures: usize,
}

pub struct Orchestrator {
    db: Arc<dyn Database>,
    channels: Vec<Channel>,
    drain: InboxDrain,
    initiation: Option<OutreachInitiation>,
    sweep: Option<TimeoutSweep>,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        channels: Vec<Channel>,
        drain: InboxDrain,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            channels,
            drain,
            initiation: None,
            sweep: None,
            poll_interval,
        }
    }

    pub fn with_initiation(mut self, initiation: OutreachInitiation) -> Self {
        self.initiation = Some(initiation);
        self
    }

    pub fn with_timeout_sweep(mut self, sweep: TimeoutSweep) -> Self {
        self.sweep = Some(sweep);
        self
    }

    /// Block until the store answers, retrying every polling interval.
    ///
    /// Returns `false` if shutdown was requested while waiting.
    pub async fn wait_for_store(&self, shutdown: &AtomicBool) -> bool {
        loop {
            match self.db.ping().await {
                Ok(()) => return true,
                Err(e) => warn!(error = %e, "Store not ready, retrying"),
            }
            tokio::time::sleep(self.poll_interval).await;
            if shutdown.load(Ordering::Relaxed) {
                return false;
            }
        }
    }

    /// Run one full cycle. Never fails: store errors are logged and counted.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        if let Some(initiation) = &self.initiation {
            match initiation.run(Utc::now()).await {
                Ok(n) => report.contacted = n,
                Err(e) => {
                    error!(error = %e, "Outreach initiation failed");
                    report.failures += 1;
                }
            }
        }

        for &channel in &self.channels {
            match self.drain.drain(channel).await {
                Ok(drained) => report.drained.push((channel, drained)),
                Err(e) => {
                    error!(channel = %channel, error = %e, "Inbox drain failed");
                    report.failures += 1;
                }
            }
        }

        if let Some(sweep) = &self.sweep {
            match sweep.run(Utc::now()).await {
                Ok(n) => report.reminded = n,
                Err(e) => {
                    error!(error = %e, "Timeout sweep failed");
                    report.failures += 1;
                }
            }
        }

        report
    }

    /// Cycle until `shutdown` is set. An in-flight cycle always completes.
    ///
    /// The first cycle starts right away; after that the loop sleeps a full
    /// `poll_interval` between the end of one cycle and the start of the next.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        if !self.wait_for_store(&shutdown).await {
            return;
        }
        info!(
            channels = ?self.channels,
            initiation = self.initiation.is_some(),
            sweep = self.sweep.is_some(),
            "Orchestrator started, polling every {:?}",
            self.poll_interval
        );

        while !shutdown.load(Ordering::Relaxed) {
            let report = self.run_cycle().await;
            let claimed: usize = report.drained.iter().map(|(_, d)| d.claimed).sum();
            if report.contacted + claimed + report.reminded + report.failures > 0 {
                info!(
                    contacted = report.contacted,
                    claimed,
                    reminded = report.reminded,
                    failures = report.failures,
                    "Cycle complete"
                );
            }

            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("Orchestrator shutting down");
    }
}

/// Spawn the orchestrator on the runtime.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_orchestrator(orchestrator: Orchestrator) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        orchestrator.run(shutdown).await;
    });

    (handle, shutdown_flag)
}
