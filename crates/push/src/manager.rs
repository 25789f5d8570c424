//! Push job orchestration.
//!
//! A job is delivered in passes. Each pass opens one remote session,
//! sends every file that is still pending and below the retry ceiling,
//! and then either completes the job, fails it, or schedules the next
//! pass after [`backoff`]. The sweep is the only scheduler: it enqueues
//! jobs whose `not_before` has passed and reaps finished and stale ones.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tardis_checksum::HashingReader;
use tardis_credentials::{CertificateSigner, CredentialError, CredentialStore};
use tardis_model::{
    Credential, Dataset, DatasetId, FileId, FileRecord, FileStatus, HostId, JobId, PushJob,
    PushJobFileProgress, PushTarget, RemoteHost, Secret,
};
use tardis_transfer::{ByteStream, Probe, ProviderRegistry, TransferError, TransferProvider};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::remote::RemoteSession;
use crate::{
    Catalog, JobStore, MAX_RETRIES, PushError, STALE_AFTER, SessionFactory, backoff, layout,
};

const SOURCE_MISSING: &str = "source file missing";

/// A request to deliver a target to a remote host.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub user: String,
    pub target: PushTarget,
    pub host_id: HostId,
    /// Use this credential instead of searching for one.
    pub credential_id: Option<String>,
    /// Remote directory below which `mytardis-<job id>` is created.
    pub base_dir: Option<String>,
    pub remote_user: Option<String>,
}

/// What happened to a submitted request.
#[derive(Debug, Clone, PartialEq)]
pub enum PushReceipt {
    Queued { job_id: JobId, message: String },
    /// No credential grants access to the host. `url` starts the
    /// certificate authorization flow when a signing service is configured.
    AuthorizationRequired { host_id: HostId, url: Option<Url> },
}

/// Notifications emitted by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Progress {
        job_id: JobId,
        file_id: FileId,
        done: usize,
        total: usize,
    },
    Completed {
        job_id: JobId,
        user: String,
        remote_dir: String,
        message: String,
    },
    Failed {
        job_id: JobId,
        user: String,
        done: usize,
        total: usize,
        last_error: Option<String>,
        message: String,
        files: Vec<PushJobFileProgress>,
    },
    Abandoned {
        job_id: JobId,
        user: String,
        done: usize,
        total: usize,
    },
}

/// Result of one pass over a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    Failed,
    Rescheduled(DateTime<Utc>),
    /// The job was deleted before or during the pass.
    Gone,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub target: PushTarget,
    pub host_id: HostId,
    pub status: String,
    pub total: usize,
    pub done: usize,
    /// Files that reached the retry ceiling.
    pub failed: usize,
    pub last_error: Option<String>,
    pub passes: u32,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Jobs processed concurrently.
    pub workers: usize,
    pub sweep_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Summary {
    total: usize,
    done: usize,
    retryable: usize,
    exhausted: usize,
    last_error: Option<String>,
}

impl Summary {
    fn of(rows: &[PushJobFileProgress]) -> Self {
        let open = || rows.iter().filter(|r| !r.is_done());
        Self {
            total: rows.len(),
            done: rows.iter().filter(|r| r.is_done()).count(),
            retryable: open().filter(|r| r.retry < MAX_RETRIES).count(),
            exhausted: open().filter(|r| r.retry >= MAX_RETRIES).count(),
            last_error: open()
                .filter(|r| r.error.is_some())
                .max_by_key(|r| r.last_attempt)
                .and_then(|r| r.error.clone()),
        }
    }
}

struct Inner {
    jobs: JobStore,
    catalog: Arc<dyn Catalog>,
    credentials: Arc<CredentialStore>,
    registry: Arc<ProviderRegistry>,
    sessions: Arc<dyn SessionFactory>,
    signer: Option<Arc<CertificateSigner>>,
    config: ManagerConfig,
    events_tx: mpsc::Sender<PushEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<PushEvent>>>,
    queue_tx: mpsc::UnboundedSender<JobId>,
    queue_rx: StdMutex<Option<mpsc::UnboundedReceiver<JobId>>>,
}

/// Accepts push requests and drives their jobs to completion.
#[derive(Clone)]
pub struct PushJobManager {
    inner: Arc<Inner>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PushJobManager {
    pub fn new(
        jobs: JobStore,
        catalog: Arc<dyn Catalog>,
        credentials: Arc<CredentialStore>,
        registry: Arc<ProviderRegistry>,
        sessions: Arc<dyn SessionFactory>,
        signer: Option<Arc<CertificateSigner>>,
        config: ManagerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                jobs,
                catalog,
                credentials,
                registry,
                sessions,
                signer,
                config,
                events_tx,
                events_rx: StdMutex::new(Some(events_rx)),
                queue_tx,
                queue_rx: StdMutex::new(Some(queue_rx)),
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<PushEvent>> {
        lock(&self.inner.events_rx).take()
    }

    fn emit(&self, event: PushEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.inner.events_tx.try_send(event) {
            warn!(?event, "push event channel full, dropping event");
        }
    }

    fn enqueue(&self, job_id: JobId) {
        if self.inner.queue_tx.send(job_id).is_err() {
            debug!(job = job_id, "push workers gone, job waits for the next start");
        }
    }

    fn target_files(&self, target: PushTarget) -> Result<Vec<FileRecord>, PushError> {
        match self.inner.catalog.files_for(target) {
            None => Err(PushError::UnknownTarget(target.to_string())),
            Some(files) if files.is_empty() => {
                Err(PushError::UnknownTarget(format!("{target} has no files")))
            }
            Some(files) => Ok(files),
        }
    }

    fn host(&self, id: HostId) -> Result<RemoteHost, PushError> {
        self.inner
            .credentials
            .host(id)
            .ok_or(PushError::UnknownHost(id))
    }

    async fn credential_in_use(&self, id: &str) -> bool {
        self.inner
            .jobs
            .jobs()
            .await
            .iter()
            .any(|job| job.credential_id == id)
    }

    /// Queues a push, or asks for authorization if no credential works.
    ///
    /// An ephemeral credential serves exactly one job, so it is never found
    /// by search and cannot be named by a second request.
    pub async fn submit(&self, request: PushRequest) -> Result<PushReceipt, PushError> {
        let host = self.host(request.host_id)?;
        let files = self.target_files(request.target)?;
        let credentials = &self.inner.credentials;

        let credential = match &request.credential_id {
            Some(id) => {
                let credential = credentials
                    .credential(id)
                    .filter(|c| c.user == request.user && c.serves(host.id))
                    .ok_or_else(|| CredentialError::NotFound(format!("credential {id}")))?;
                if credential.is_ephemeral() && self.credential_in_use(id).await {
                    return Err(CredentialError::NotFound(format!(
                        "credential {id} already belongs to another push"
                    ))
                    .into());
                }
                credentials.check_access(&credential, &host).await?;
                credential
            }
            None => match credentials
                .get_suitable(&request.user, host.id, request.remote_user.as_deref())
                .await
            {
                Ok(credential) => credential,
                Err(CredentialError::NoSuitableCredential { .. }) => {
                    let state = format!("{}:{}", request.target.kind(), request.target.id());
                    let url = self
                        .inner
                        .signer
                        .as_ref()
                        .and_then(|s| s.authorization_url(&host, &state));
                    info!(user = %request.user, host = %host.name, "no usable credential, authorization required");
                    return Ok(PushReceipt::AuthorizationRequired {
                        host_id: host.id,
                        url,
                    });
                }
                Err(e) => return Err(e.into()),
            },
        };
        self.queue(&request, &credential, &host, &files).await
    }

    /// Queues a push with a freshly signed ephemeral credential.
    ///
    /// `token` is the OAuth token returned by the authorization flow.
    pub async fn submit_signed(
        &self,
        request: PushRequest,
        token: &Secret,
    ) -> Result<PushReceipt, PushError> {
        let signer = self.inner.signer.as_ref().ok_or_else(|| {
            CredentialError::Signing("no certificate signing service configured".into())
        })?;
        let host = self.host(request.host_id)?;
        let files = self.target_files(request.target)?;
        let remote_user = request.remote_user.as_deref().unwrap_or(&request.user);
        let credential = self
            .inner
            .credentials
            .sign_ephemeral(&request.user, remote_user, host.id, signer, token)
            .await?;
        self.queue(&request, &credential, &host, &files).await
    }

    async fn queue(
        &self,
        request: &PushRequest,
        credential: &Credential,
        host: &RemoteHost,
        files: &[FileRecord],
    ) -> Result<PushReceipt, PushError> {
        let ids: Vec<FileId> = files.iter().map(|f| f.id).collect();
        let job = self
            .inner
            .jobs
            .create(
                &request.user,
                request.target,
                credential.id.clone(),
                host.id,
                request.base_dir.as_deref().unwrap_or_default(),
                &ids,
                Utc::now(),
            )
            .await?;
        info!(job = job.id, target = %job.target, host = %host.name, files = ids.len(), "push job queued");
        self.enqueue(job.id);
        Ok(PushReceipt::Queued {
            job_id: job.id,
            message: format!(
                "{} ({} files) queued for transfer to {} as job {}",
                job.target,
                ids.len(),
                host.name,
                job.id
            ),
        })
    }

    pub async fn status(&self, job_id: JobId) -> Option<JobStatus> {
        let job = self.inner.jobs.job(job_id).await?;
        let rows = self.inner.jobs.progress(job_id).await?;
        let summary = Summary::of(&rows);
        Some(JobStatus {
            job_id,
            target: job.target,
            host_id: job.host_id,
            status: job.status,
            total: summary.total,
            done: summary.done,
            failed: summary.exhausted,
            last_error: summary.last_error,
            passes: job.passes,
            not_before: job.not_before,
        })
    }

    /// Deletes a job. A pass that is still running stops at its next update.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, PushError> {
        let Some(job) = self.inner.jobs.job(job_id).await else {
            return Ok(false);
        };
        if !self.inner.jobs.delete(job_id).await? {
            return Ok(false);
        }
        info!(job = job_id, "push job cancelled");
        self.dispose_credential(&job).await;
        Ok(true)
    }

    /// Runs one delivery pass over `job_id`.
    pub async fn run_pass(&self, job_id: JobId) -> Result<PassOutcome, PushError> {
        let jobs = &self.inner.jobs;
        let (Some(job), Some(rows)) = (jobs.job(job_id).await, jobs.progress(job_id).await) else {
            return Ok(PassOutcome::Gone);
        };
        let pending: Vec<PushJobFileProgress> = rows
            .iter()
            .filter(|r| !r.is_done() && r.retry < MAX_RETRIES)
            .cloned()
            .collect();
        if pending.is_empty() {
            return self.conclude(job, None).await;
        }

        let Some(host) = self.inner.credentials.host(job.host_id) else {
            let reason = format!("remote host {} no longer exists", job.host_id);
            return self.fail(job, &rows, Some(reason)).await;
        };
        let Some(credential) = self.inner.credentials.credential(&job.credential_id) else {
            let reason = format!("credential {} no longer exists", job.credential_id);
            return self.fail(job, &rows, Some(reason)).await;
        };

        info!(job = job_id, host = %host.name, pending = pending.len(), pass = job.passes + 1, "starting push pass");
        let session = match self.inner.sessions.open(&credential, &host).await {
            Ok(session) => session,
            Err(e) => {
                warn!(job = job_id, host = %host.name, error = %e, "could not open session");
                return self.conclude(job, Some(e.to_string())).await;
            }
        };

        let job_dir = layout::job_dir(&job.base_dir, job.id);
        let done = Summary::of(&rows).done;
        let result = match session.mkdir_p(&job_dir).await {
            Ok(()) => {
                self.deliver_pending(&job, &job_dir, session.as_ref(), pending, done, rows.len())
                    .await
            }
            Err(e) => Ok(Some(e.to_string())),
        };
        session.close().await;

        let aborted = result?;
        self.conclude(job, aborted).await
    }

    /// Sends each pending file. Returns the session error that cut the
    /// pass short, if any.
    async fn deliver_pending(
        &self,
        job: &PushJob,
        job_dir: &str,
        session: &dyn RemoteSession,
        pending: Vec<PushJobFileProgress>,
        mut done: usize,
        total: usize,
    ) -> Result<Option<String>, PushError> {
        let mut datasets = HashMap::new();
        for mut row in pending {
            row.last_attempt = Some(Utc::now());
            let mut aborted = None;
            match self.deliver(session, job_dir, row.file_id, &mut datasets).await {
                Ok(()) => {
                    row.status = FileStatus::Done;
                    row.error = None;
                }
                Err(PushError::Session(reason)) => {
                    // Only the file in flight is charged; the rest wait for the next pass.
                    row.retry += 1;
                    warn!(job = job.id, file = row.file_id, retry = row.retry, error = %reason, "session lost, ending pass");
                    row.error = Some(reason.clone());
                    aborted = Some(reason);
                }
                Err(e) => {
                    row.retry += 1;
                    row.error = Some(e.to_string());
                    warn!(job = job.id, file = row.file_id, retry = row.retry, error = %e, "file delivery failed");
                }
            }
            if !self.inner.jobs.update_progress(job.id, &row).await? {
                debug!(job = job.id, "job removed during pass");
                return Ok(None);
            }
            if row.is_done() {
                done += 1;
                self.emit(PushEvent::Progress {
                    job_id: job.id,
                    file_id: row.file_id,
                    done,
                    total,
                });
            }
            if aborted.is_some() {
                return Ok(aborted);
            }
        }
        Ok(None)
    }

    async fn deliver(
        &self,
        session: &dyn RemoteSession,
        job_dir: &str,
        file_id: FileId,
        datasets: &mut HashMap<DatasetId, Dataset>,
    ) -> Result<(), PushError> {
        let file = self
            .inner
            .catalog
            .file(file_id)
            .ok_or_else(|| PushError::File(format!("file {file_id} is not in the catalog")))?;
        let dataset = match datasets.entry(file.dataset_id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let dataset = self.inner.catalog.dataset(file.dataset_id).ok_or_else(|| {
                    PushError::File(format!("dataset {} is not in the catalog", file.dataset_id))
                })?;
                slot.insert(dataset)
            }
        };

        let path = layout::file_path(job_dir, dataset, &file)?;
        let (stream, size) = self
            .open_source(&file)
            .await
            .ok_or_else(|| PushError::File(SOURCE_MISSING.into()))?;
        if let Some(dir) = layout::parent(&path) {
            session.mkdir_p(dir).await?;
        }

        let (reader, sums) = HashingReader::new(stream);
        session.upload(Box::pin(reader), size, &path).await?;
        let sent = sums.snapshot();
        if sent.size != size {
            return Err(PushError::File(format!(
                "read {} of {size} bytes from source",
                sent.size
            )));
        }
        if let Some(md5) = file.md5.as_deref().filter(|m| !m.is_empty())
            && !md5.eq_ignore_ascii_case(&sent.md5)
        {
            return Err(PushError::File("source does not match its recorded checksum".into()));
        }
        if let Some(remote) = session.md5(&path).await?
            && !remote.eq_ignore_ascii_case(&sent.md5)
        {
            return Err(PushError::File(format!("remote checksum mismatch for {path}")));
        }
        debug!(file = file.id, %path, size, "file delivered");
        Ok(())
    }

    /// Opens the first readable replica of `file`, best Location first.
    async fn open_source(&self, file: &FileRecord) -> Option<(ByteStream, u64)> {
        let registry = &self.inner.registry;
        let mut replicas = self.inner.catalog.replicas(file.id);
        replicas.retain(|r| registry.location(&r.location).is_some_and(|l| l.online));
        replicas.sort_by_key(|r| {
            std::cmp::Reverse(registry.location(&r.location).map_or(i32::MIN, |l| l.priority))
        });

        for replica in replicas {
            let Some(provider) = registry.provider(&replica.location) else {
                continue;
            };
            let uri = match registry.resolve(&replica.location, &replica.uri) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(file = file.id, uri = %replica.uri, error = %e, "unusable replica URI");
                    continue;
                }
            };
            let size = match file.size {
                Some(size) => size,
                None => match provider.length(&uri).await {
                    Ok(Probe::Found(size)) => size,
                    Ok(Probe::Missing) => continue,
                    Err(e) => {
                        warn!(file = file.id, %uri, error = %e, "could not size replica");
                        continue;
                    }
                },
            };
            match provider.open(&uri).await {
                Ok(stream) => return Some((stream, size)),
                Err(TransferError::NotFound(_)) => debug!(file = file.id, %uri, "replica missing"),
                Err(e) => warn!(file = file.id, %uri, error = %e, "could not open replica"),
            }
        }
        None
    }

    /// Completes, fails or reschedules a job from its current rows.
    async fn conclude(
        &self,
        mut job: PushJob,
        aborted: Option<String>,
    ) -> Result<PassOutcome, PushError> {
        let Some(rows) = self.inner.jobs.progress(job.id).await else {
            return Ok(PassOutcome::Gone);
        };
        let summary = Summary::of(&rows);
        if summary.done == summary.total {
            return self.complete(job).await;
        }
        if summary.retryable == 0 {
            return self.fail(job, &rows, None).await;
        }

        job.passes += 1;
        let delay = backoff(job.passes);
        job.not_before = Utc::now() + delay;
        job.status = format!(
            "{}/{} files transferred, next attempt in {} min",
            summary.done,
            summary.total,
            delay.num_minutes()
        );
        if let Some(reason) = aborted {
            job.status.push_str(&format!(" ({reason})"));
        }
        if !self.inner.jobs.update_job(&job).await? {
            return Ok(PassOutcome::Gone);
        }
        info!(job = job.id, passes = job.passes, not_before = %job.not_before, "push job rescheduled");
        Ok(PassOutcome::Rescheduled(job.not_before))
    }

    async fn complete(&self, job: PushJob) -> Result<PassOutcome, PushError> {
        if !self.inner.jobs.delete(job.id).await? {
            return Ok(PassOutcome::Gone);
        }
        let remote_dir = layout::job_dir(&job.base_dir, job.id);
        info!(job = job.id, %remote_dir, "push job completed");
        self.dispose_credential(&job).await;
        self.emit(PushEvent::Completed {
            job_id: job.id,
            message: format!("Transfer of {} complete, files are in {remote_dir}", job.target),
            user: job.user,
            remote_dir,
        });
        Ok(PassOutcome::Completed)
    }

    async fn fail(
        &self,
        job: PushJob,
        rows: &[PushJobFileProgress],
        reason: Option<String>,
    ) -> Result<PassOutcome, PushError> {
        if !self.inner.jobs.delete(job.id).await? {
            return Ok(PassOutcome::Gone);
        }
        let summary = Summary::of(rows);
        let last_error = reason.or(summary.last_error);
        let mut message = format!(
            "Transfer of {} failed: {}/{} files transferred",
            job.target, summary.done, summary.total
        );
        if let Some(e) = &last_error {
            message.push_str(&format!("; last error: {e}"));
        }
        error!(job = job.id, done = summary.done, total = summary.total, "push job failed");
        self.dispose_credential(&job).await;
        self.emit(PushEvent::Failed {
            job_id: job.id,
            user: job.user,
            done: summary.done,
            total: summary.total,
            last_error,
            message,
            files: rows.to_vec(),
        });
        Ok(PassOutcome::Failed)
    }

    async fn dispose_credential(&self, job: &PushJob) {
        let credentials = &self.inner.credentials;
        if let Some(credential) = credentials.credential(&job.credential_id)
            && credential.is_ephemeral()
            && let Err(e) = credentials.delete(&credential.id).await
        {
            warn!(job = job.id, credential = %credential.id, error = %e, "failed to delete ephemeral credential");
        }
    }

    /// Reaps finished and stale jobs and returns the ids of jobs due for a pass.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, PushError> {
        let mut due = Vec::new();
        for job in self.inner.jobs.jobs().await {
            let Some(rows) = self.inner.jobs.progress(job.id).await else {
                continue;
            };
            let summary = Summary::of(&rows);
            if summary.done == summary.total {
                self.complete(job).await?;
            } else if now - job.created_at > STALE_AFTER {
                if self.inner.jobs.delete(job.id).await? {
                    warn!(job = job.id, "push job abandoned after a week");
                    self.dispose_credential(&job).await;
                    self.emit(PushEvent::Abandoned {
                        job_id: job.id,
                        user: job.user,
                        done: summary.done,
                        total: summary.total,
                    });
                }
            } else if summary.retryable == 0 {
                self.fail(job, &rows, None).await?;
            } else if job.not_before <= now {
                due.push(job.id);
            }
        }
        Ok(due)
    }

    /// Runs the sweep and a bounded pool of passes until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut queue) = lock(&self.inner.queue_rx).take() else {
            warn!("push workers already running");
            return;
        };
        let workers = self.inner.config.workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let in_flight: Arc<StdMutex<HashSet<JobId>>> = Arc::default();
        let mut sweep = tokio::time::interval(self.inner.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(workers, "push workers started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep.tick() => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(due) => due.into_iter().for_each(|id| self.enqueue(id)),
                        Err(e) => error!(error = %e, "push sweep failed"),
                    }
                }
                Some(job_id) = queue.recv() => {
                    if !lock(&in_flight).insert(job_id) {
                        continue;
                    }
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = Arc::clone(&permits).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let manager = self.clone();
                    let in_flight = Arc::clone(&in_flight);
                    tokio::spawn(async move {
                        match manager.run_pass(job_id).await {
                            Ok(outcome) => debug!(job = job_id, ?outcome, "pass finished"),
                            Err(e) => error!(job = job_id, error = %e, "pass failed"),
                        }
                        lock(&in_flight).remove(&job_id);
                        drop(permit);
                    });
                }
            }
        }
        info!("push workers stopped");
    }
}
