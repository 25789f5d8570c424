//! Host-key pinning.
//!
//! A [`RemoteHost`](tardis_model::RemoteHost) may carry the expected
//! `SHA256:` fingerprint of its host key. When a pin is present the
//! presented key must match it exactly; an unpinned host is accepted
//! with a warning.

use tracing::warn;

use crate::SshError;

/// Compares a presented fingerprint against the pinned one.
pub fn verify_host_key(host: &str, pinned: Option<&str>, presented: &str) -> Result<(), SshError> {
    let Some(expected) = pinned.map(str::trim).filter(|p| !p.is_empty()) else {
        warn!(%host, fingerprint = %presented, "no pinned host key, accepting presented key");
        return Ok(());
    };

    if normalize(expected) == normalize(presented) {
        Ok(())
    } else {
        Err(SshError::HostKeyMismatch {
            host: host.into(),
            expected: expected.into(),
            presented: presented.into(),
        })
    }
}

/// Fingerprints are compared without the optional `SHA256:` prefix and
/// base64 padding; the digest itself is case-sensitive.
fn normalize(fingerprint: &str) -> &str {
    let fp = fingerprint.trim();
    let fp = fp.strip_prefix("SHA256:").unwrap_or(fp);
    fp.trim_end_matches('=')
}
