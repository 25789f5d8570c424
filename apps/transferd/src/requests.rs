//! Request spool.
//!
//! Clients drop one JSON request per file into the spool directory
//! (writing `<name>.json.tmp` and renaming it to `<name>.json`). The daemon
//! answers each with `<name>.reply.json` and removes the request.
//!
//! ```json
//! {"action": "push", "user": "alice", "target": {"type": "dataset", "id": 7}, "host_id": 4}
//! {"action": "status", "job_id": 12}
//! {"action": "verify", "location": "store", "uri": "7/a.txt", "expected": {"md5": "..."}}
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tardis_model::{HostId, JobId, PushTarget};
use tardis_push::{JobStatus, PushJobManager, PushReceipt, PushRequest};
use tardis_transfer::{Expected, ReplicaVerifier, VerificationReport, VerifyOptions};
use tokio_util::sync::CancellationToken;

const REQUEST_SUFFIX: &str = ".json";
const REPLY_SUFFIX: &str = ".reply.json";

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Request {
    Push {
        user: String,
        target: PushTarget,
        host_id: HostId,
        #[serde(default)]
        credential_id: Option<String>,
        #[serde(default)]
        base_dir: Option<String>,
        #[serde(default)]
        remote_user: Option<String>,
    },
    Status {
        job_id: JobId,
    },
    Verify {
        location: String,
        uri: String,
        #[serde(default)]
        expected: Expected,
        #[serde(default)]
        options: VerifyOptions,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum Reply {
    Queued {
        job_id: JobId,
        message: String,
    },
    AuthorizationRequired {
        host_id: HostId,
        url: Option<String>,
    },
    Status {
        job: Option<JobStatus>,
    },
    Verification(VerificationReport),
    Error {
        message: String,
    },
}

impl From<PushReceipt> for Reply {
    fn from(receipt: PushReceipt) -> Self {
        match receipt {
            PushReceipt::Queued { job_id, message } => Self::Queued { job_id, message },
            PushReceipt::AuthorizationRequired { host_id, url } => Self::AuthorizationRequired {
                host_id,
                url: url.map(String::from),
            },
        }
    }
}

/// Answers requests dropped into a directory.
pub struct RequestSpool {
    dir: PathBuf,
    manager: PushJobManager,
    verifier: ReplicaVerifier,
}

impl RequestSpool {
    pub fn new(dir: PathBuf, manager: PushJobManager, verifier: ReplicaVerifier) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            manager,
            verifier,
        })
    }

    /// Polls the spool until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(dir = %self.dir.display(), "watching request spool");
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(dir = %self.dir.display(), error = %e, "request spool scan failed");
                    }
                }
            }
        }
    }

    /// Answers every pending request. Returns how many were handled.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let mut pending = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_request(&path) {
                pending.push(path);
            }
        }
        pending.sort();

        for path in &pending {
            let reply = match tokio::fs::read(path).await {
                Ok(bytes) => match serde_json::from_slice::<Request>(&bytes) {
                    Ok(request) => self.handle(request).await,
                    Err(e) => Reply::Error {
                        message: format!("malformed request: {e}"),
                    },
                },
                Err(e) => Reply::Error {
                    message: format!("unreadable request: {e}"),
                },
            };
            if let Reply::Error { message } = &reply {
                tracing::warn!(request = %path.display(), %message, "request refused");
            }
            write_reply(&reply_path(path), &reply).await?;
            tokio::fs::remove_file(path).await?;
        }
        Ok(pending.len())
    }

    async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Push {
                user,
                target,
                host_id,
                credential_id,
                base_dir,
                remote_user,
            } => {
                let request = PushRequest {
                    user,
                    target,
                    host_id,
                    credential_id,
                    base_dir,
                    remote_user,
                };
                match self.manager.submit(request).await {
                    Ok(receipt) => receipt.into(),
                    Err(e) => Reply::Error {
                        message: e.to_string(),
                    },
                }
            }
            Request::Status { job_id } => Reply::Status {
                job: self.manager.status(job_id).await,
            },
            Request::Verify {
                location,
                uri,
                expected,
                options,
            } => match self.verifier.check(&location, &uri, &expected, options).await {
                Ok(report) => Reply::Verification(report),
                Err(e) => Reply::Error {
                    message: e.to_string(),
                },
            },
        }
    }
}

fn is_request(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(REQUEST_SUFFIX) && !n.ends_with(REPLY_SUFFIX))
}

fn reply_path(request: &Path) -> PathBuf {
    let name = request
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(REQUEST_SUFFIX))
        .unwrap_or("request");
    request.with_file_name(format!("{name}{REPLY_SUFFIX}"))
}

async fn write_reply(path: &Path, reply: &Reply) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(reply)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;
    use tardis_credentials::{CredentialStore, SshAccessVerifier};
    use tardis_model::Location;
    use tardis_push::{JobStore, ManagerConfig, MemoryCatalog, SshSessionFactory};
    use tardis_transfer::RegistryBuilder;

    use super::*;

    fn spool(dir: &Path) -> RequestSpool {
        let store = dir.join("store");
        std::fs::create_dir_all(store.join("7")).unwrap();
        std::fs::write(store.join("7/a.txt"), "hello world").unwrap();
        let base = format!("file://{}/", store.display());
        let registry = Arc::new(
            RegistryBuilder::new()
                .build(&[Location::new("store", "local", &base)])
                .unwrap(),
        );

        let timeout = Duration::from_secs(1);
        let credentials = Arc::new(
            CredentialStore::open(dir.join("credentials.json"), Arc::new(SshAccessVerifier::new(timeout)))
                .unwrap(),
        );
        let manager = PushJobManager::new(
            JobStore::open(dir.join("jobs.json")).unwrap(),
            Arc::new(MemoryCatalog::default()),
            credentials,
            Arc::clone(&registry),
            Arc::new(SshSessionFactory::new(timeout)),
            None,
            ManagerConfig::default(),
        );
        RequestSpool::new(dir.join("requests"), manager, ReplicaVerifier::new(registry)).unwrap()
    }

    fn reply(dir: &Path, name: &str) -> Value {
        let bytes = std::fs::read(dir.join("requests").join(format!("{name}{REPLY_SUFFIX}"))).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn only_finished_request_files_are_picked_up() {
        assert!(is_request(Path::new("/s/0001.json")));
        assert!(!is_request(Path::new("/s/0001.reply.json")));
        assert!(!is_request(Path::new("/s/0001.json.tmp")));
        assert!(!is_request(Path::new("/s/notes.txt")));
        assert_eq!(reply_path(Path::new("/s/0001.json")), Path::new("/s/0001.reply.json"));
    }

    #[tokio::test]
    async fn verify_request_is_answered_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        std::fs::write(
            dir.path().join("requests/good.json"),
            r#"{"action": "verify", "location": "store", "uri": "7/a.txt",
                "expected": {"size": 11, "md5": "5eb63bbbe01eeed093cb22bb8f5acdc3"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("requests/bad.json"),
            r#"{"action": "verify", "location": "store", "uri": "7/a.txt",
                "expected": {"md5": "00000000000000000000000000000000"}}"#,
        )
        .unwrap();

        assert_eq!(spool.poll_once().await.unwrap(), 2);
        let good = reply(dir.path(), "good");
        assert_eq!(good["result"], "verification");
        assert_eq!(good["verified"], true);
        assert_eq!(good["method"], "fetched_checksum");
        let bad = reply(dir.path(), "bad");
        assert_eq!(bad["verified"], false);

        assert!(!dir.path().join("requests/good.json").exists());
        assert_eq!(spool.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn push_for_unknown_host_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        std::fs::write(
            dir.path().join("requests/push.json"),
            r#"{"action": "push", "user": "alice", "target": {"type": "dataset", "id": 7}, "host_id": 99}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("requests/status.json"), r#"{"action": "status", "job_id": 1}"#)
            .unwrap();

        assert_eq!(spool.poll_once().await.unwrap(), 2);
        let push = reply(dir.path(), "push");
        assert_eq!(push["result"], "error");
        assert!(push["message"].as_str().unwrap().contains("99"), "{push}");
        let status = reply(dir.path(), "status");
        assert_eq!(status["result"], "status");
        assert!(status["job"].is_null());
    }

    #[tokio::test]
    async fn malformed_request_gets_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let spool = spool(dir.path());
        std::fs::write(dir.path().join("requests/junk.json"), "{not json").unwrap();

        assert_eq!(spool.poll_once().await.unwrap(), 1);
        let junk = reply(dir.path(), "junk");
        assert_eq!(junk["result"], "error");
        assert!(junk["message"].as_str().unwrap().starts_with("malformed request"));
        assert!(!dir.path().join("requests/junk.json").exists());
    }
}
