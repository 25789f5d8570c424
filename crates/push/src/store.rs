use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tardis_model::{CredentialId, FileId, HostId, JobId, PushJob, PushJobFileProgress, PushTarget};
use tokio::sync::Mutex;
use tracing::debug;

use crate::PushError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    job: PushJob,
    files: Vec<PushJobFileProgress>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    next_id: JobId,
    #[serde(default)]
    jobs: BTreeMap<JobId, Entry>,
}

/// Push jobs and their progress rows.
///
/// Every mutation is written through to disk before it returns, so a
/// restarted daemon resumes from the last recorded file. Updates addressed
/// to a deleted job are dropped and reported as `false`.
pub struct JobStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl JobStore {
    /// Opens the store at `path`, loading existing jobs.
    pub fn open(path: PathBuf) -> Result<Self, PushError> {
        let state = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let state: State = serde_json::from_str(&data)?;
            debug!(jobs = state.jobs.len(), "loaded job store from {:?}", path);
            state
        } else {
            State::default()
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::default()),
        }
    }

    async fn save(&self, state: &State) -> Result<(), PushError> {
        if let Some(path) = &self.path {
            persist(path, state).await?;
        }
        Ok(())
    }

    /// Creates a job with one pending row per file. It is due at once.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        user: &str,
        target: PushTarget,
        credential_id: CredentialId,
        host_id: HostId,
        base_dir: &str,
        files: &[FileId],
        now: DateTime<Utc>,
    ) -> Result<PushJob, PushError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let job = PushJob {
            id: state.next_id,
            user: user.into(),
            target,
            credential_id,
            host_id,
            base_dir: base_dir.into(),
            status: "queued".into(),
            created_at: now,
            not_before: now,
            passes: 0,
        };
        let files = files.iter().copied().map(PushJobFileProgress::pending).collect();
        state.jobs.insert(
            job.id,
            Entry {
                job: job.clone(),
                files,
            },
        );
        self.save(&state).await?;
        Ok(job)
    }

    pub async fn job(&self, id: JobId) -> Option<PushJob> {
        self.state.lock().await.jobs.get(&id).map(|e| e.job.clone())
    }

    pub async fn progress(&self, id: JobId) -> Option<Vec<PushJobFileProgress>> {
        self.state.lock().await.jobs.get(&id).map(|e| e.files.clone())
    }

    pub async fn jobs(&self) -> Vec<PushJob> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .map(|e| e.job.clone())
            .collect()
    }

    /// Replaces the progress row for `row.file_id`.
    pub async fn update_progress(
        &self,
        id: JobId,
        row: &PushJobFileProgress,
    ) -> Result<bool, PushError> {
        let mut state = self.state.lock().await;
        let Some(slot) = state
            .jobs
            .get_mut(&id)
            .and_then(|e| e.files.iter_mut().find(|p| p.file_id == row.file_id))
        else {
            return Ok(false);
        };
        *slot = row.clone();
        self.save(&state).await?;
        Ok(true)
    }

    /// Replaces the job row, keeping its progress rows.
    pub async fn update_job(&self, job: &PushJob) -> Result<bool, PushError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        entry.job = job.clone();
        self.save(&state).await?;
        Ok(true)
    }

    /// Deletes a job together with its progress rows.
    pub async fn delete(&self, id: JobId) -> Result<bool, PushError> {
        let mut state = self.state.lock().await;
        if state.jobs.remove(&id).is_none() {
            return Ok(false);
        }
        self.save(&state).await?;
        Ok(true)
    }
}

async fn persist(path: &Path, state: &State) -> Result<(), PushError> {
    let json = serde_json::to_string_pretty(state)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tardis_model::FileStatus;

    async fn seeded(store: &JobStore) -> PushJob {
        store
            .create(
                "alice",
                PushTarget::Dataset(3),
                "cred".into(),
                1,
                "/scratch",
                &[10, 11],
                Utc::now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_adds_pending_rows() {
        let store = JobStore::in_memory();
        let job = seeded(&store).await;
        assert_eq!(job.id, 1);
        assert_eq!(job.not_before, job.created_at);
        let rows = store.progress(job.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == FileStatus::Pending));
        assert_eq!(seeded(&store).await.id, 2);
    }

    #[tokio::test]
    async fn delete_cascades_and_later_updates_are_dropped() {
        let store = JobStore::in_memory();
        let job = seeded(&store).await;
        assert!(store.delete(job.id).await.unwrap());
        assert!(!store.delete(job.id).await.unwrap());
        assert!(store.progress(job.id).await.is_none());

        let mut row = PushJobFileProgress::pending(10);
        row.status = FileStatus::Done;
        assert!(!store.update_progress(job.id, &row).await.unwrap());
        assert!(!store.update_job(&job).await.unwrap());
        assert!(store.job(job.id).await.is_none());
    }

    #[tokio::test]
    async fn progress_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let id = {
            let store = JobStore::open(path.clone()).unwrap();
            let job = seeded(&store).await;
            let mut row = PushJobFileProgress::pending(11);
            row.status = FileStatus::Done;
            assert!(store.update_progress(job.id, &row).await.unwrap());
            job.id
        };

        let store = JobStore::open(path).unwrap();
        let rows = store.progress(id).await.unwrap();
        assert!(!rows[0].is_done());
        assert!(rows[1].is_done());
        assert_eq!(seeded(&store).await.id, id + 1);
    }
}
