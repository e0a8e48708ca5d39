use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::anyhow;

use super::queue::{JobQueue, JobRecord, JobState};
use crate::{context::AppContext, eid::Eid};

enum Message {
    Run(Eid),
    Shutdown,
}

/// Fixed pool of worker threads fed from one channel.
///
/// The channel only carries job ids; the durable state lives in [`JobQueue`].
pub struct JobRunner {
    queue: Arc<JobQueue>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Per-job threads still alive, abandoned ones included. A job thread that
/// outlives its timeout keeps its slot until it returns.
struct JobThreads {
    live: AtomicUsize,
    limit: usize,
}

struct ThreadSlot(Arc<JobThreads>);

impl JobThreads {
    fn try_acquire(self: &Arc<Self>) -> Option<ThreadSlot> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| ThreadSlot(self.clone()))
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What every worker needs to run a job.
struct Worker {
    ctx: AppContext,
    queue: Arc<JobQueue>,
    timeout: Duration,
    threads: Arc<JobThreads>,
}

impl JobRunner {
    /// Spawn the configured number of workers and hand them every job left
    /// pending by a previous process.
    pub fn start(ctx: AppContext, queue: Arc<JobQueue>) -> Self {
        let config = ctx.config.jobs.clone();
        let workers = config.workers.max(1);
        let worker = Arc::new(Worker {
            ctx,
            queue: queue.clone(),
            timeout: Duration::from_secs(config.job_timeout_secs),
            threads: Arc::new(JobThreads {
                live: AtomicUsize::new(0),
                limit: workers as usize + config.max_stalled_jobs,
            }),
        });

        let (tx, rx) = mpsc::channel::<Message>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|n| {
                let rx = rx.clone();
                let worker = worker.clone();
                std::thread::Builder::new()
                    .name(format!("job-worker-{n}"))
                    .spawn(move || worker_loop(n, rx, worker))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    log::error!("failed to spawn job worker: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();

        log::info!("started {} job workers", handles.len());

        for id in queue.pending() {
            log::info!("restarting job {id}");
            let _ = tx.send(Message::Run(id));
        }

        Self {
            queue,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Hand a queued job to the pool.
    pub fn submit(&self, id: Eid) -> anyhow::Result<()> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        sender
            .as_ref()
            .ok_or_else(|| anyhow!("job runner is shut down"))?
            .send(Message::Run(id))
            .map_err(|_| anyhow!("job workers are gone"))
    }

    /// Let workers finish what they hold, then join them. Jobs still queued
    /// stay in the dump and are picked up on the next start.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..workers.len() {
            let _ = sender.send(Message::Shutdown);
        }
        drop(sender);

        log::warn!("waiting for {} job workers to stop", workers.len());
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                log::error!("job worker panicked");
            }
        }
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(n: u16, rx: Arc<Mutex<mpsc::Receiver<Message>>>, worker: Arc<Worker>) {
    log::debug!("worker {n} waiting for jobs");
    loop {
        // the receiver lock is held only while waiting for the next message
        let message = {
            let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.recv()
        };

        match message {
            Ok(Message::Run(id)) => {
                if let Some(job) = worker.queue.claim(&id) {
                    worker.process(job);
                }
            }
            Ok(Message::Shutdown) | Err(_) => break,
        }
    }
    log::debug!("worker {n} stopped");
}

impl Worker {
    /// Run one claimed job to exactly one terminal state. A transient input
    /// is gone before the terminal state becomes visible.
    fn process(&self, job: JobRecord) {
        let state = self.run(&job);

        match &state {
            JobState::Failed(reason) => log::warn!("job {} failed: {reason}", job.id),
            _ => log::info!("job {} completed", job.id),
        }

        if let Some(path) = job.task.transient_file() {
            match std::fs::remove_file(path) {
                Ok(()) => log::debug!("removed upload {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("failed to remove upload {}: {err}", path.display()),
            }
        }

        self.queue.finish(&job.id, state);
    }

    fn run(&self, job: &JobRecord) -> JobState {
        let Some(slot) = self.threads.try_acquire() else {
            return JobState::Failed("refused: too many stalled jobs are still running".into());
        };

        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("job-{}", job.id))
            .spawn({
                let ctx = self.ctx.clone();
                let task = job.task.clone();
                move || {
                    let _slot = slot;
                    let _ = tx.send(task.run(&ctx));
                }
            });

        if let Err(err) = spawned {
            return JobState::Failed(format!("failed to start job: {err}"));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(output)) => JobState::Completed(output),
            Ok(Err(err)) => JobState::Failed(err.to_string()),
            // the job thread is left to finish on its own; its result is discarded
            Err(RecvTimeoutError::Timeout) => {
                JobState::Failed(format!("timed out after {}s", self.timeout.as_secs_f32()))
            }
            Err(RecvTimeoutError::Disconnected) => JobState::Failed("job panicked".into()),
        }
    }
}
