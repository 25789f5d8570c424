use std::time::Duration;

use tardis_model::{Credential, RemoteHost};
use tardis_ssh::{SshAuth, SshSession, SshTarget};
use tracing::debug;

use crate::{BoxFuture, CredentialError};

/// Live check that a credential can open a session on a host.
pub trait AccessVerifier: Send + Sync {
    fn verify_access<'a>(
        &'a self,
        credential: &'a Credential,
        host: &'a RemoteHost,
    ) -> BoxFuture<'a, Result<(), CredentialError>>;
}

/// Builds the SSH target for `credential` on `host`, pinning the host key.
///
/// A signed certificate takes precedence over the bare key, and a key over
/// a password.
pub fn ssh_target(
    credential: &Credential,
    host: &RemoteHost,
    timeout: Duration,
) -> Result<SshTarget, CredentialError> {
    let auth = match (&credential.key, &credential.password) {
        (Some(key), _) => match &key.certificate {
            Some(cert) => SshAuth::Certificate {
                pem: key.private_key.clone(),
                certificate: cert.clone(),
            },
            None => SshAuth::PrivateKey {
                pem: key.private_key.clone(),
                passphrase: None,
            },
        },
        (None, Some(password)) => SshAuth::Password(password.clone()),
        (None, None) => {
            return Err(CredentialError::Key(format!(
                "credential {} has neither key nor password",
                credential.id
            )));
        }
    };
    Ok(SshTarget::new(&host.hostname, host.port, &credential.remote_user, auth)
        .with_pinned_fingerprint(host.host_key.clone())
        .with_timeout(timeout))
}

/// Verifies access by connecting and authenticating over SSH.
pub struct SshAccessVerifier {
    timeout: Duration,
}

impl SshAccessVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AccessVerifier for SshAccessVerifier {
    fn verify_access<'a>(
        &'a self,
        credential: &'a Credential,
        host: &'a RemoteHost,
    ) -> BoxFuture<'a, Result<(), CredentialError>> {
        Box::pin(async move {
            let target = ssh_target(credential, host, self.timeout)?;
            let session = SshSession::connect(&target).await?;
            session.close().await;
            debug!(credential = %credential.id, host = %host.name, "access verified");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tardis_model::{CredentialKind, KeyMaterial, Secret};

    fn host() -> RemoteHost {
        RemoteHost {
            id: 1,
            name: "hpc".into(),
            hostname: "hpc.example.org".into(),
            port: 2222,
            host_key: Some("SHA256:pinned".into()),
            administrator: "admin".into(),
        }
    }

    fn credential(key: Option<KeyMaterial>, password: Option<&str>) -> Credential {
        Credential {
            id: "c1".into(),
            user: "alice".into(),
            remote_user: "alice_hpc".into(),
            password: password.map(Secret::new),
            key,
            hosts: vec![1],
            kind: CredentialKind::Registered,
            created_at: Utc::now(),
        }
    }

    fn key(certificate: Option<&str>) -> KeyMaterial {
        KeyMaterial {
            private_key: Secret::new("pem"),
            public_key: "ssh-ed25519 AAAA".into(),
            certificate: certificate.map(str::to_string),
        }
    }

    #[test]
    fn target_pins_host_key() {
        let t = ssh_target(&credential(None, Some("pw")), &host(), Duration::from_secs(3)).unwrap();
        assert_eq!(t.host, "hpc.example.org");
        assert_eq!(t.port, 2222);
        assert_eq!(t.username, "alice_hpc");
        assert_eq!(t.pinned_fingerprint.as_deref(), Some("SHA256:pinned"));
        assert!(matches!(t.auth, SshAuth::Password(_)));
    }

    #[test]
    fn certificate_beats_key_beats_password() {
        let t = ssh_target(&credential(Some(key(Some("cert"))), Some("pw")), &host(), Duration::from_secs(1)).unwrap();
        assert!(matches!(t.auth, SshAuth::Certificate { .. }));
        let t = ssh_target(&credential(Some(key(None)), Some("pw")), &host(), Duration::from_secs(1)).unwrap();
        assert!(matches!(t.auth, SshAuth::PrivateKey { .. }));
    }

    #[test]
    fn empty_credential_is_rejected() {
        assert!(matches!(
            ssh_target(&credential(None, None), &host(), Duration::from_secs(1)),
            Err(CredentialError::Key(_))
        ));
    }
}
