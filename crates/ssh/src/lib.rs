//! SSH plumbing for SCP replicas and remote pushes.
//!
//! - [`session`]: russh client sessions with fail-closed host-key pinning
//! - [`scp`]: the SCP sink/source wire protocol over any async stream
//! - [`hostkey`]: fingerprint comparison used by the session handler
//! - [`keygen`]: keypair generation for new credentials
//! - `testing`: a loopback SSH host, behind the `test-server` feature

pub mod error;
pub mod hostkey;
pub mod keygen;
pub mod scp;
pub mod session;
#[cfg(any(test, feature = "test-server"))]
pub mod testing;

pub use error::SshError;
pub use hostkey::verify_host_key;
pub use keygen::{GeneratedKey, fingerprint, generate_ed25519};
pub use scp::ScpHeader;
pub use session::{ExecOutput, SshAuth, SshSession, SshTarget};

use std::time::Duration;

/// Default bound on connect, authentication and per-command waits.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}
