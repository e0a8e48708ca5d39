use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::task::{JobOutput, Task};
use crate::{config::JobsConfig, eid::Eid, storage::StorageManager};

pub const QUEUE_DUMP_FILE: &str = "search-jobs.json";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed(JobOutput),
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed(_) | JobState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed(_) => "completed",
            JobState::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Eid,
    pub user_id: String,
    pub task: Task,
    pub state: JobState,
    pub enqueued_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueDump {
    pub jobs: Vec<JobRecord>,
    pub now: i64,
}

/// Durable job table.
///
/// The whole table is rewritten through the storage manager on every state
/// change, so a restart sees every job a previous process accepted.
pub struct JobQueue {
    storage: Arc<dyn StorageManager>,
    dump: Mutex<QueueDump>,
    keep_completed: usize,
    keep_failed: usize,
}

impl JobQueue {
    /// Load the dump left by a previous process. Jobs it left queued or
    /// active are reset to queued and reported by [`JobQueue::pending`].
    pub fn open(storage: Arc<dyn StorageManager>, config: &JobsConfig) -> anyhow::Result<Self> {
        let mut dump = if storage.exists(QUEUE_DUMP_FILE) {
            let data = storage.read(QUEUE_DUMP_FILE)?;
            match serde_json::from_slice::<QueueDump>(&data) {
                Ok(dump) => dump,
                Err(err) => {
                    let aside = format!("{QUEUE_DUMP_FILE}.corrupt");
                    match storage.write(&aside, &data) {
                        Ok(()) => log::error!(
                            "job queue dump is unreadable ({err}), moved to {aside}; starting empty"
                        ),
                        Err(write_err) => log::error!(
                            "job queue dump is unreadable ({err}) and could not be kept: {write_err}"
                        ),
                    }
                    QueueDump::default()
                }
            }
        } else {
            QueueDump::default()
        };

        let mut interrupted = 0;
        for job in dump.jobs.iter_mut() {
            if job.state == JobState::Active {
                job.state = JobState::Queued;
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            log::info!("{interrupted} interrupted jobs will be restarted");
        }

        let queue = Self {
            storage,
            dump: Mutex::new(dump),
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
        };
        queue.persist(&mut queue.lock());

        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, QueueDump> {
        self.dump.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, dump: &mut QueueDump) {
        dump.now = now();
        let data = match serde_json::to_vec_pretty(&*dump) {
            Ok(data) => data,
            Err(err) => {
                log::error!("failed to serialize job queue: {err}");
                return;
            }
        };
        if let Err(err) = self.storage.write(QUEUE_DUMP_FILE, &data) {
            log::error!("failed to write job queue dump: {err}");
        }
    }

    /// Record a new queued job. Fails only if the job cannot be made durable.
    pub fn push(&self, user_id: &str, task: Task) -> anyhow::Result<JobRecord> {
        let record = JobRecord {
            id: Eid::new(),
            user_id: user_id.to_string(),
            task,
            state: JobState::Queued,
            enqueued_at: now(),
            finished_at: None,
        };

        let mut dump = self.lock();
        dump.jobs.push(record.clone());
        dump.now = now();

        let data = serde_json::to_vec_pretty(&*dump)?;
        if let Err(err) = self.storage.write(QUEUE_DUMP_FILE, &data) {
            dump.jobs.retain(|j| j.id != record.id);
            return Err(err.into());
        }

        Ok(record)
    }

    pub fn get(&self, id: &Eid) -> Option<JobRecord> {
        self.lock().jobs.iter().find(|j| &j.id == id).cloned()
    }

    pub fn list(&self) -> Vec<JobRecord> {
        self.lock().jobs.clone()
    }

    /// Ids of jobs waiting for a worker, oldest first.
    pub fn pending(&self) -> Vec<Eid> {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Queued)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Claim a queued job for a worker. `None` if it is gone or already claimed.
    pub fn claim(&self, id: &Eid) -> Option<JobRecord> {
        let mut dump = self.lock();
        let job = dump.jobs.iter_mut().find(|j| &j.id == id)?;
        if job.state != JobState::Queued {
            return None;
        }
        job.state = JobState::Active;
        let claimed = job.clone();
        self.persist(&mut dump);
        Some(claimed)
    }

    /// Move an active job to its terminal state. A job is finished at most once.
    pub fn finish(&self, id: &Eid, state: JobState) -> bool {
        debug_assert!(state.is_terminal());

        let mut dump = self.lock();
        let Some(job) = dump.jobs.iter_mut().find(|j| &j.id == id) else {
            return false;
        };
        if job.state.is_terminal() {
            log::warn!("job {id} already {}", job.state.name());
            return false;
        }
        job.state = state;
        job.finished_at = Some(now());

        self.purge(&mut dump);
        self.persist(&mut dump);
        true
    }

    /// Keep only the newest `keep_completed` / `keep_failed` finished jobs.
    fn purge(&self, dump: &mut QueueDump) {
        let mut finished: Vec<(i64, usize, bool)> = dump
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.state.is_terminal())
            .map(|(idx, j)| {
                (
                    j.finished_at.unwrap_or(j.enqueued_at),
                    idx,
                    matches!(j.state, JobState::Completed(_)),
                )
            })
            .collect();
        // newest first; table order breaks ties
        finished.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let mut completed = 0;
        let mut failed = 0;
        let mut evict = vec![];
        for (_, idx, is_completed) in finished {
            let (count, cap) = if is_completed {
                (&mut completed, self.keep_completed)
            } else {
                (&mut failed, self.keep_failed)
            };
            *count += 1;
            if *count > cap {
                evict.push(idx);
            }
        }

        if !evict.is_empty() {
            log::debug!("purging {} finished jobs", evict.len());
            let mut idx = 0;
            dump.jobs.retain(|_| {
                let keep = !evict.contains(&idx);
                idx += 1;
                keep
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::ImageSource;
    use crate::storage::BackendLocal;

    fn config(keep_completed: usize, keep_failed: usize) -> JobsConfig {
        JobsConfig {
            keep_completed,
            keep_failed,
            ..Default::default()
        }
    }

    fn task(n: u64) -> Task {
        Task::RefreshEmbedding { entity_id: n }
    }

    fn queue(dir: &std::path::Path, config: &JobsConfig) -> JobQueue {
        let storage = Arc::new(BackendLocal::new(dir).unwrap());
        JobQueue::open(storage, config).unwrap()
    }

    #[test]
    fn test_push_claim_finish() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = queue(tmp.path(), &config(100, 50));

        let job = queue.push("u1", task(1)).unwrap();
        assert_eq!(queue.pending(), vec![job.id.clone()]);

        let claimed = queue.claim(&job.id).unwrap();
        assert_eq!(claimed.state, JobState::Active);
        assert!(queue.claim(&job.id).is_none());

        assert!(queue.finish(&job.id, JobState::Failed("boom".into())));
        // terminal states are final
        assert!(!queue.finish(&job.id, JobState::Completed(JobOutput::Matches(vec![]))));

        let job = queue.get(&job.id).unwrap();
        assert_eq!(job.state, JobState::Failed("boom".into()));
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_unreadable_dump_starts_empty_and_is_kept_aside() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(QUEUE_DUMP_FILE), b"{\"jobs\": [tru").unwrap();

        let queue = queue(tmp.path(), &config(100, 50));
        assert!(queue.list().is_empty());

        let aside = tmp.path().join(format!("{QUEUE_DUMP_FILE}.corrupt"));
        assert_eq!(std::fs::read(aside).unwrap(), b"{\"jobs\": [tru");
        // the live dump is a fresh, readable one
        let fresh = std::fs::read(tmp.path().join(QUEUE_DUMP_FILE)).unwrap();
        assert!(serde_json::from_slice::<QueueDump>(&fresh).is_ok());
    }

    #[test]
    fn test_dump_survives_restart_and_requeues_active() {
        let tmp = tempfile::tempdir().unwrap();
        let (active, queued, done) = {
            let queue = queue(tmp.path(), &config(100, 50));
            let active = queue
                .push(
                    "u1",
                    Task::ImageSearch {
                        source: ImageSource::Path("uploads/a.png".into()),
                        transient: true,
                    },
                )
                .unwrap();
            let queued = queue.push("u1", task(2)).unwrap();
            let done = queue.push("u2", task(3)).unwrap();
            queue.claim(&active.id).unwrap();
            queue.claim(&done.id).unwrap();
            queue.finish(&done.id, JobState::Completed(JobOutput::Matches(vec![])));
            (active.id, queued.id, done.id)
        };

        let queue = queue(tmp.path(), &config(100, 50));
        assert_eq!(queue.list().len(), 3);
        assert_eq!(queue.pending(), vec![active.clone(), queued]);
        assert_eq!(queue.get(&active).unwrap().state, JobState::Queued);
        assert!(queue.get(&done).unwrap().state.is_terminal());
    }

    #[test]
    fn test_retention_caps() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = queue(tmp.path(), &config(2, 1));

        let mut ids = vec![];
        for n in 0..6 {
            let job = queue.push("u1", task(n)).unwrap();
            queue.claim(&job.id).unwrap();
            let state = if n % 2 == 0 {
                JobState::Completed(JobOutput::Matches(vec![]))
            } else {
                JobState::Failed(format!("job {n} failed"))
            };
            queue.finish(&job.id, state);
            ids.push(job.id);
        }
        let pending = queue.push("u1", task(99)).unwrap();

        let remaining: Vec<Eid> = queue.list().into_iter().map(|j| j.id).collect();
        // newest two completed (2, 4), newest failed (5), and the queued job
        assert_eq!(
            remaining,
            vec![ids[2].clone(), ids[4].clone(), ids[5].clone(), pending.id]
        );
    }
}
