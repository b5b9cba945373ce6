// Worker pool for parallel task execution

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::debug;

use crate::config::Config;

use super::detect::DetectedEncoders;
use super::pipeline::{TaskContext, TaskReport, run_task};
use super::process::{CancelToken, ProcessRunner, ProcessTable};
use super::scheduler::Scheduler;

/// Message from a worker to the collector loop.
#[derive(Debug)]
pub enum WorkerEvent {
    TaskStarted { worker_id: usize, input: PathBuf },
    TaskFinished { worker_id: usize, report: TaskReport },
}

/// Fixed pool of OS threads, one per unit of global concurrency. Submission
/// is fire-and-forget through a channel; results arrive on another channel in
/// completion order.
pub struct WorkerPool {
    job_tx: Sender<PathBuf>,
    event_rx: Receiver<WorkerEvent>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        cfg: Arc<Config>,
        detected: Arc<DetectedEncoders>,
        scheduler: Arc<Scheduler>,
        table: ProcessTable,
        cancel: CancelToken,
    ) -> Self {
        let (job_tx, job_rx) = unbounded::<PathBuf>();
        let (event_tx, event_rx) = unbounded::<WorkerEvent>();

        let handles = (0..workers)
            .map(|worker_id| {
                let job_rx = job_rx.clone();
                let event_tx = event_tx.clone();
                let cfg = Arc::clone(&cfg);
                let detected = Arc::clone(&detected);
                let scheduler = Arc::clone(&scheduler);
                let runner = ProcessRunner::new(table.clone(), cancel.clone());
                let cancel = cancel.clone();

                thread::spawn(move || {
                    let ctx = TaskContext {
                        cfg: &cfg,
                        detected: &detected,
                        scheduler: &scheduler,
                        runner: &runner,
                        cancel: &cancel,
                    };
                    // Drain the queue even during shutdown: cancelled tasks
                    // still produce reports, so the collector's bookkeeping
                    // always adds up.
                    while let Ok(input) = job_rx.recv() {
                        let _ = event_tx.send(WorkerEvent::TaskStarted {
                            worker_id,
                            input: input.clone(),
                        });
                        let report = run_task(&ctx, &input);
                        let _ = event_tx.send(WorkerEvent::TaskFinished { worker_id, report });
                    }
                    debug!(worker_id, "worker exiting");
                })
            })
            .collect();

        Self {
            job_tx,
            event_rx,
            handles,
        }
    }

    pub fn submit(&self, input: PathBuf) {
        // Receivers only disconnect after close(); during a run this cannot
        // fail, and after shutdown a drop is harmless.
        let _ = self.job_tx.send(input);
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.event_rx
    }

    /// Close the queue and wait for every worker to finish its last task.
    pub fn join(self) {
        drop(self.job_tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
