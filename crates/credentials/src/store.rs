use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tardis_model::{Credential, CredentialKind, HostId, KeyMaterial, RemoteHost, Secret};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{AccessVerifier, CertificateSigner, CredentialError, MIN_KEY_BITS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    hosts: Vec<RemoteHost>,
    #[serde(default)]
    credentials: Vec<Credential>,
}

/// Persistent store of remote hosts and the credentials that reach them.
///
/// Reads clone an `Arc` of the current snapshot. Writes are serialized,
/// build a new snapshot, persist it (temp file then rename) and only then
/// publish it.
pub struct CredentialStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Snapshot>>,
    write: Mutex<()>,
    verifier: Arc<dyn AccessVerifier>,
}

impl CredentialStore {
    /// Opens the store at `path`, loading existing records.
    pub fn open(path: PathBuf, verifier: Arc<dyn AccessVerifier>) -> Result<Self, CredentialError> {
        let snapshot = load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(snapshot)),
            write: Mutex::new(()),
            verifier,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory(verifier: Arc<dyn AccessVerifier>) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(Snapshot::default())),
            write: Mutex::new(()),
            verifier,
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Applies `edit` to a copy of the current snapshot, persists and publishes it.
    async fn update<T>(
        &self,
        edit: impl FnOnce(&mut Snapshot) -> T,
    ) -> Result<T, CredentialError> {
        let _guard = self.write.lock().await;
        let mut next = (*self.snapshot()).clone();
        let out = edit(&mut next);
        if let Some(path) = &self.path {
            persist(path, &next).await?;
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        Ok(out)
    }

    pub fn hosts(&self) -> Vec<RemoteHost> {
        self.snapshot().hosts.clone()
    }

    pub fn host(&self, id: HostId) -> Option<RemoteHost> {
        self.snapshot().hosts.iter().find(|h| h.id == id).cloned()
    }

    /// Inserts or replaces a host record.
    pub async fn upsert_host(&self, host: RemoteHost) -> Result<(), CredentialError> {
        self.update(|s| {
            s.hosts.retain(|h| h.id != host.id);
            s.hosts.push(host);
        })
        .await
    }

    pub fn credential(&self, id: &str) -> Option<Credential> {
        self.snapshot()
            .credentials
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Credentials of `user` registered against `host`, oldest first.
    ///
    /// Ephemeral credentials belong to the push they were signed for and
    /// are never offered here.
    pub fn candidates(
        &self,
        user: &str,
        host: HostId,
        remote_user: Option<&str>,
    ) -> Vec<Credential> {
        let mut found: Vec<Credential> = self
            .snapshot()
            .credentials
            .iter()
            .filter(|c| c.user == user && c.serves(host) && !c.is_ephemeral())
            .filter(|c| remote_user.is_none_or(|r| c.remote_user == r))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }

    pub async fn insert(&self, credential: Credential) -> Result<(), CredentialError> {
        let id = credential.id.clone();
        self.update(|s| {
            s.credentials.retain(|c| c.id != credential.id);
            s.credentials.push(credential);
        })
        .await?;
        debug!(credential = %id, "credential stored");
        Ok(())
    }

    /// Deletes a credential and its key material. Returns `false` if it
    /// was already gone.
    pub async fn delete(&self, id: &str) -> Result<bool, CredentialError> {
        let removed = self
            .update(|s| {
                let before = s.credentials.len();
                s.credentials.retain(|c| c.id != id);
                before != s.credentials.len()
            })
            .await?;
        if removed {
            info!(credential = %id, "credential deleted");
        }
        Ok(removed)
    }

    /// Registers a password credential for `user` on `hosts`.
    pub async fn add_password(
        &self,
        user: &str,
        remote_user: &str,
        password: Secret,
        hosts: Vec<HostId>,
    ) -> Result<Credential, CredentialError> {
        let credential = Credential {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            remote_user: remote_user.into(),
            password: Some(password),
            key: None,
            hosts,
            kind: CredentialKind::Registered,
            created_at: Utc::now(),
        };
        self.insert(credential.clone()).await?;
        Ok(credential)
    }

    /// Returns the first credential of `user` that can actually log in to `host`.
    pub async fn get_suitable(
        &self,
        user: &str,
        host_id: HostId,
        remote_user: Option<&str>,
    ) -> Result<Credential, CredentialError> {
        let host = self
            .host(host_id)
            .ok_or_else(|| CredentialError::NotFound(format!("host {host_id}")))?;
        for credential in self.candidates(user, host_id, remote_user) {
            match self.verifier.verify_access(&credential, &host).await {
                Ok(()) => return Ok(credential),
                Err(e) => {
                    debug!(credential = %credential.id, host = %host.name, error = %e, "credential rejected")
                }
            }
        }
        Err(CredentialError::NoSuitableCredential {
            user: user.into(),
            host: host.name,
        })
    }

    /// Live access check for a credential chosen by the caller.
    pub async fn check_access(
        &self,
        credential: &Credential,
        host: &RemoteHost,
    ) -> Result<(), CredentialError> {
        self.verifier.verify_access(credential, host).await
    }

    /// Generates and stores a keypair for `user` on `hosts`.
    ///
    /// Keys are Ed25519, which meets any requested strength up to
    /// RSA-3072. The public key still has to be installed on the hosts
    /// (or signed) before the credential grants access.
    pub async fn generate_keypair(
        &self,
        user: &str,
        remote_user: &str,
        hosts: Vec<HostId>,
        bits: u32,
    ) -> Result<Credential, CredentialError> {
        let credential = self
            .new_key_credential(user, remote_user, hosts, bits, CredentialKind::Registered)?;
        self.insert(credential.clone()).await?;
        info!(credential = %credential.id, %user, %remote_user, "keypair generated");
        Ok(credential)
    }

    fn new_key_credential(
        &self,
        user: &str,
        remote_user: &str,
        hosts: Vec<HostId>,
        bits: u32,
        kind: CredentialKind,
    ) -> Result<Credential, CredentialError> {
        if bits < MIN_KEY_BITS {
            return Err(CredentialError::Key(format!(
                "{bits}-bit keys are below the {MIN_KEY_BITS}-bit minimum"
            )));
        }
        if bits > 3072 {
            warn!(bits, "issuing an Ed25519 key in place of the requested RSA strength");
        }
        let generated =
            tardis_ssh::generate_ed25519().map_err(|e| CredentialError::Key(e.to_string()))?;
        Ok(Credential {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            remote_user: remote_user.into(),
            password: None,
            key: Some(KeyMaterial {
                private_key: generated.private_openssh,
                public_key: generated.public_openssh,
                certificate: None,
            }),
            hosts,
            kind,
            created_at: Utc::now(),
        })
    }

    /// Creates an ephemeral certificate-signed credential for one push.
    ///
    /// If the signed credential cannot log in it is deleted at once and
    /// [`CredentialError::NoSuitableCredential`] is returned; certificates
    /// are never retried.
    pub async fn sign_ephemeral(
        &self,
        user: &str,
        remote_user: &str,
        host_id: HostId,
        signer: &CertificateSigner,
        token: &Secret,
    ) -> Result<Credential, CredentialError> {
        let host = self
            .host(host_id)
            .ok_or_else(|| CredentialError::NotFound(format!("host {host_id}")))?;
        let mut credential = self.new_key_credential(
            user,
            remote_user,
            vec![host_id],
            MIN_KEY_BITS,
            CredentialKind::Ephemeral,
        )?;
        let certificate = match &credential.key {
            Some(key) => signer.sign(&key.public_key, remote_user, &host, token).await?,
            None => return Err(CredentialError::Key("generated credential has no key".into())),
        };
        if let Some(key) = credential.key.as_mut() {
            key.certificate = Some(certificate);
        }
        self.insert(credential.clone()).await?;

        if let Err(e) = self.verifier.verify_access(&credential, &host).await {
            warn!(credential = %credential.id, host = %host.name, error = %e, "signed credential rejected, deleting");
            self.delete(&credential.id).await?;
            return Err(CredentialError::NoSuitableCredential {
                user: user.into(),
                host: host.name,
            });
        }
        info!(credential = %credential.id, host = %host.name, "ephemeral credential issued");
        Ok(credential)
    }
}

fn load(path: &Path) -> Result<Snapshot, CredentialError> {
    if !path.exists() {
        return Ok(Snapshot::default());
    }
    let data = std::fs::read_to_string(path)?;
    let snapshot: Snapshot = serde_json::from_str(&data)?;
    debug!(
        hosts = snapshot.hosts.len(),
        credentials = snapshot.credentials.len(),
        "loaded credential store from {:?}",
        path
    );
    Ok(snapshot)
}

async fn persist(path: &Path, snapshot: &Snapshot) -> Result<(), CredentialError> {
    let json = serde_json::to_string_pretty(snapshot)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    // Key material and passwords: owner only.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
    }
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Grants access to an explicit set of credential ids, or to any
    /// credential carrying a certificate when `accept_certificates` is set.
    #[derive(Default)]
    struct Allow {
        ids: StdMutex<HashSet<String>>,
        accept_certificates: bool,
    }

    impl AccessVerifier for Allow {
        fn verify_access<'a>(
            &'a self,
            credential: &'a Credential,
            _host: &'a RemoteHost,
        ) -> BoxFuture<'a, Result<(), CredentialError>> {
            let ok = self.ids.lock().unwrap().contains(&credential.id)
                || (self.accept_certificates
                    && credential.key.as_ref().is_some_and(|k| k.certificate.is_some()));
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(CredentialError::Access(tardis_ssh::SshError::AuthFailed {
                        user: credential.remote_user.clone(),
                        host: "test".into(),
                    }))
                }
            })
        }
    }

    fn host(id: HostId) -> RemoteHost {
        RemoteHost {
            id,
            name: format!("host{id}"),
            hostname: format!("host{id}.example.org"),
            port: 22,
            host_key: None,
            administrator: String::new(),
        }
    }

    async fn store_with(allow: Arc<Allow>) -> CredentialStore {
        let store = CredentialStore::in_memory(allow);
        store.upsert_host(host(1)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn get_suitable_returns_first_that_verifies() {
        let allow = Arc::new(Allow::default());
        let store = store_with(allow.clone()).await;
        let dead = store
            .add_password("alice", "a", Secret::new("old"), vec![1])
            .await
            .unwrap();
        let live = store
            .add_password("alice", "a", Secret::new("new"), vec![1])
            .await
            .unwrap();
        allow.ids.lock().unwrap().insert(live.id.clone());

        let got = store.get_suitable("alice", 1, None).await.unwrap();
        assert_eq!(got.id, live.id);
        assert_ne!(got.id, dead.id);
    }

    #[tokio::test]
    async fn no_verifying_credential_is_no_suitable() {
        let store = store_with(Arc::new(Allow::default())).await;
        store
            .add_password("alice", "a", Secret::new("pw"), vec![1])
            .await
            .unwrap();
        assert!(matches!(
            store.get_suitable("alice", 1, None).await,
            Err(CredentialError::NoSuitableCredential { .. })
        ));
        assert!(matches!(
            store.get_suitable("bob", 1, None).await,
            Err(CredentialError::NoSuitableCredential { .. })
        ));
    }

    #[tokio::test]
    async fn remote_user_filter() {
        let allow = Arc::new(Allow::default());
        let store = store_with(allow.clone()).await;
        let c = store
            .add_password("alice", "alice_hpc", Secret::new("pw"), vec![1])
            .await
            .unwrap();
        allow.ids.lock().unwrap().insert(c.id.clone());
        assert!(store.get_suitable("alice", 1, Some("alice_hpc")).await.is_ok());
        assert!(store.get_suitable("alice", 1, Some("root")).await.is_err());
    }

    #[tokio::test]
    async fn generate_keypair_persists_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let id = {
            let store = CredentialStore::open(path.clone(), Arc::new(Allow::default())).unwrap();
            store.upsert_host(host(1)).await.unwrap();
            let c = store.generate_keypair("alice", "a", vec![1], 4096).await.unwrap();
            let key = c.key.as_ref().unwrap();
            assert!(key.public_key.starts_with("ssh-ed25519 "));
            assert!(key.certificate.is_none());
            assert!(!c.is_ephemeral());
            c.id
        };

        let reopened = CredentialStore::open(path, Arc::new(Allow::default())).unwrap();
        assert!(reopened.credential(&id).is_some());
        assert_eq!(reopened.hosts().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn store_file_is_private_to_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(path.with_extension("json.tmp"), "stale").unwrap();
        std::fs::set_permissions(
            path.with_extension("json.tmp"),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let store = CredentialStore::open(path.clone(), Arc::new(Allow::default())).unwrap();
        store.upsert_host(host(1)).await.unwrap();
        store.generate_keypair("alice", "a", vec![1], 3072).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(std::fs::read_to_string(&path).unwrap().contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn weak_keys_are_refused() {
        let store = store_with(Arc::new(Allow::default())).await;
        assert!(matches!(
            store.generate_keypair("alice", "a", vec![1], 1024).await,
            Err(CredentialError::Key(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_reported_once() {
        let store = store_with(Arc::new(Allow::default())).await;
        let c = store
            .add_password("alice", "a", Secret::new("pw"), vec![1])
            .await
            .unwrap();
        assert!(store.delete(&c.id).await.unwrap());
        assert!(!store.delete(&c.id).await.unwrap());
        assert!(store.credential(&c.id).is_none());
    }

    #[tokio::test]
    async fn snapshots_are_unaffected_by_later_writes() {
        let store = store_with(Arc::new(Allow::default())).await;
        let before = store.snapshot();
        store
            .add_password("alice", "a", Secret::new("pw"), vec![1])
            .await
            .unwrap();
        assert!(before.credentials.is_empty());
        assert_eq!(store.snapshot().credentials.len(), 1);
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let store = store_with(Arc::new(Allow::default())).await;
        assert!(matches!(
            store.get_suitable("alice", 99, None).await,
            Err(CredentialError::NotFound(_))
        ));
    }

    async fn signing_server() -> Option<httpmock::MockServer> {
        if std::net::TcpListener::bind("127.0.0.1:0").is_err() {
            eprintln!("Skipping httpmock tests: cannot bind to localhost");
            return None;
        }
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/sign");
                then.status(200)
                    .json_body(serde_json::json!({ "certificate": "ssh-ed25519-cert-v01@openssh.com AAAA" }));
            })
            .await;
        Some(server)
    }

    #[tokio::test]
    async fn ephemeral_credential_is_kept_when_it_verifies() {
        let Some(server) = signing_server().await else {
            return;
        };
        let allow = Arc::new(Allow {
            accept_certificates: true,
            ..Allow::default()
        });
        let store = store_with(allow).await;
        let signer = CertificateSigner::new(&server.url("/sign"), None, Duration::from_secs(5)).unwrap();

        let c = store
            .sign_ephemeral("alice", "a", 1, &signer, &Secret::new("tok"))
            .await
            .unwrap();
        assert!(c.is_ephemeral());
        assert!(c.key.as_ref().unwrap().certificate.is_some());
        assert!(store.credential(&c.id).is_some());
    }

    #[tokio::test]
    async fn ephemeral_credential_failing_access_is_deleted() {
        let Some(server) = signing_server().await else {
            return;
        };
        let store = store_with(Arc::new(Allow::default())).await;
        let signer = CertificateSigner::new(&server.url("/sign"), None, Duration::from_secs(5)).unwrap();

        let before = store.snapshot().credentials.len();
        let err = store
            .sign_ephemeral("alice", "a", 1, &signer, &Secret::new("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::NoSuitableCredential { .. }));
        assert_eq!(store.snapshot().credentials.len(), before);
    }

    #[tokio::test]
    async fn ephemeral_credentials_are_not_candidates() {
        let allow = Arc::new(Allow::default());
        let store = store_with(allow.clone()).await;
        let mut ephemeral = store
            .new_key_credential("alice", "a", vec![1], MIN_KEY_BITS, CredentialKind::Ephemeral)
            .unwrap();
        ephemeral.id = "eph".into();
        store.insert(ephemeral).await.unwrap();
        allow.ids.lock().unwrap().insert("eph".into());

        assert!(store.candidates("alice", 1, None).is_empty());
        assert!(matches!(
            store.get_suitable("alice", 1, None).await,
            Err(CredentialError::NoSuitableCredential { .. })
        ));
        assert!(store.credential("eph").is_some());
    }

    #[test]
    fn signer_requires_valid_url() {
        assert!(CertificateSigner::new("not a url", None, Duration::from_secs(1)).is_err());
    }
}
