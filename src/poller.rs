use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub items: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// One kind of batch work driven by a [`Poller`].
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs once when the poller starts, before the first cycle.
    async fn recover(&self) -> Result<()> {
        Ok(())
    }

    /// Fetches one batch of eligible work and processes it. Per-item
    /// failures are recorded on the items themselves; an `Err` here means
    /// the cycle as a whole could not run.
    async fn run_cycle(&self) -> Result<CycleReport>;
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs a [`Processor`] on a fixed interval until stopped.
///
/// The next cycle is armed only after the previous one has finished, so
/// cycles never overlap. A failing or panicking cycle is logged and the
/// loop carries on.
pub struct Poller<P: Processor> {
    processor: Arc<P>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl<P: Processor> Poller<P> {
    pub fn new(processor: P, interval: Duration) -> Self {
        Self {
            processor: Arc::new(processor),
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Starts the loop: recovery, one cycle right away, then one per interval.
    /// Does nothing if already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(poller = self.processor.name(), "already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let processor = self.processor.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            if let Err(e) = processor.recover().await {
                error!(poller = processor.name(), error = %e, "start-up recovery failed");
            }

            loop {
                run_guarded(&processor).await;

                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        info!(
            poller = self.processor.name(),
            interval_secs = interval.as_secs_f64(),
            "poller started"
        );
        *running = Some(Running { shutdown, handle });
    }

    /// Stops re-arming and waits for an in-flight cycle to finish.
    /// Does nothing if not running.
    pub async fn stop(&self) {
        let Some(Running { shutdown, handle }) = self.running.lock().await.take() else {
            debug!(poller = self.processor.name(), "not running");
            return;
        };

        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            error!(poller = self.processor.name(), error = %e, "poller task ended abnormally");
        }
        info!(poller = self.processor.name(), "poller stopped");
    }

    /// Runs recovery and a single cycle outside the loop.
    pub async fn run_once(&self) -> Option<CycleReport> {
        if let Err(e) = self.processor.recover().await {
            error!(poller = self.processor.name(), error = %e, "start-up recovery failed");
        }
        run_guarded(&self.processor).await
    }
}

/// Runs one cycle on its own task so that even a panic stays contained.
async fn run_guarded<P: Processor>(processor: &Arc<P>) -> Option<CycleReport> {
    let name = processor.name();
    let task = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run_cycle().await })
    };

    match task.await {
        Ok(Ok(report)) => {
            if report.items > 0 {
                info!(
                    poller = name,
                    items = report.items,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "cycle complete"
                );
            } else {
                debug!(poller = name, "cycle found no work");
            }
            Some(report)
        }
        Ok(Err(e)) => {
            error!(poller = name, error = %format!("{:#}", e), "cycle failed");
            None
        }
        Err(e) => {
            error!(poller = name, error = %e, "cycle panicked");
            None
        }
    }
}
