//! Integrity checks that decide whether a replica may be marked verified.
//!
//! The order is fixed: remote checksums first, then the trust-length
//! shortcut when the caller allows it, then a full fetch-and-hash. A
//! mismatch at any stage is a [`VerifyError::Mismatch`] and is never
//! softened into success.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tardis_checksum::checksum_reader;
use tardis_model::{FileRecord, Replica};
use tracing::{debug, info, warn};
use url::Url;

use crate::{Probe, ProviderRegistry, RemoteMetadata, TransferError, TransferProvider};

/// The recorded size and checksums a replica must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expected {
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub sha512: Option<String>,
}

impl Expected {
    fn md5(&self) -> Option<&str> {
        self.md5.as_deref().filter(|s| !s.is_empty())
    }

    fn sha512(&self) -> Option<&str> {
        self.sha512.as_deref().filter(|s| !s.is_empty())
    }

    pub fn has_checksums(&self) -> bool {
        self.md5().is_some() || self.sha512().is_some()
    }
}

impl From<&FileRecord> for Expected {
    fn from(file: &FileRecord) -> Self {
        Self {
            size: file.size,
            md5: file.md5.clone(),
            sha512: file.sha512.clone(),
        }
    }
}

/// Per-call verification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOptions {
    /// Overrides the Location's `trust_length` default when set.
    #[serde(default)]
    pub require_checksum: Option<bool>,
    /// Accept a length match when nothing has been recorded but a size.
    #[serde(default)]
    pub allow_empty_checksums: bool,
}

impl VerifyOptions {
    pub fn require_checksum(mut self, require: bool) -> Self {
        self.require_checksum = Some(require);
        self
    }

    pub fn allow_empty_checksums(mut self) -> Self {
        self.allow_empty_checksums = true;
        self
    }
}

/// Which check established the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMethod {
    /// A checksum reported by the backend matched without reading content.
    RemoteChecksum,
    /// Only the length was compared.
    TrustedLength,
    /// Content was fetched and a checksum matched.
    FetchedChecksum,
    /// Content was fetched; nothing but a size was recorded and it matched.
    EmptyChecksumLength,
}

impl VerifyMethod {
    /// `true` for methods that compared a checksum.
    pub fn is_checksum(self) -> bool {
        matches!(self, Self::RemoteChecksum | Self::FetchedChecksum)
    }
}

/// Answer to a verification query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verified: bool,
    pub method: Option<VerifyMethod>,
    pub detail: String,
}

/// Errors produced by verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("verification failed for {uri}: {reason}")]
    Mismatch { uri: String, reason: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl VerifyError {
    fn mismatch(uri: &Url, reason: impl Into<String>) -> Self {
        Self::Mismatch {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

/// What verification observed about the stored bytes.
#[derive(Debug, Clone)]
pub(crate) struct Observed {
    pub method: VerifyMethod,
    pub md5: Option<String>,
    pub sha512: Option<String>,
    pub length: Option<u64>,
    pub content_type: Option<String>,
}

impl Observed {
    fn from_remote(method: VerifyMethod, meta: RemoteMetadata) -> Self {
        Self {
            method,
            md5: meta.md5,
            sha512: meta.sha512,
            length: meta.length,
            content_type: None,
        }
    }
}

enum Comparison {
    Matched,
    NoChecksumCompared,
}

fn same_digest(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Compares every field present on both sides; any disagreement is a mismatch.
fn compare(
    uri: &Url,
    expected: &Expected,
    md5: Option<&str>,
    sha512: Option<&str>,
    length: Option<u64>,
) -> Result<Comparison, VerifyError> {
    if let (Some(want), Some(got)) = (expected.size, length)
        && want != got
    {
        return Err(VerifyError::mismatch(
            uri,
            format!("length {got} != expected {want}"),
        ));
    }
    let mut matched = false;
    for (name, want, got) in [
        ("md5", expected.md5(), md5),
        ("sha512", expected.sha512(), sha512),
    ] {
        if let (Some(want), Some(got)) = (want, got.filter(|s| !s.is_empty())) {
            if !same_digest(want, got) {
                return Err(VerifyError::mismatch(uri, format!("{name} mismatch")));
            }
            matched = true;
        }
    }
    Ok(if matched {
        Comparison::Matched
    } else {
        Comparison::NoChecksumCompared
    })
}

/// Runs the verification ladder against one provider.
pub(crate) async fn verify_uri(
    provider: &dyn TransferProvider,
    uri: &Url,
    expected: &Expected,
    require_checksum: bool,
    allow_empty_checksums: bool,
) -> Result<Observed, VerifyError> {
    let mut remote_length = None;

    match provider.metadata(uri).await {
        Ok(Probe::Found(meta)) => {
            match compare(uri, expected, meta.md5.as_deref(), meta.sha512.as_deref(), meta.length)? {
                Comparison::Matched => {
                    debug!(%uri, "remote checksum matched");
                    return Ok(Observed::from_remote(VerifyMethod::RemoteChecksum, meta));
                }
                Comparison::NoChecksumCompared => remote_length = meta.length,
            }
        }
        Ok(Probe::Missing) => return Err(TransferError::NotFound(uri.to_string()).into()),
        Err(TransferError::NotSupported(_)) => {}
        Err(e) => return Err(e.into()),
    }

    if !require_checksum && let Some(want) = expected.size {
        let got = match remote_length {
            Some(len) => len,
            None => provider
                .length(uri)
                .await?
                .found()
                .ok_or_else(|| TransferError::NotFound(uri.to_string()))?,
        };
        if got != want {
            return Err(VerifyError::mismatch(
                uri,
                format!("length {got} != expected {want}"),
            ));
        }
        debug!(%uri, length = got, "length trusted");
        return Ok(Observed {
            method: VerifyMethod::TrustedLength,
            md5: None,
            sha512: None,
            length: Some(got),
            content_type: None,
        });
    }

    if !expected.has_checksums() && !allow_empty_checksums {
        return Err(VerifyError::mismatch(
            uri,
            "no checksums recorded and empty checksums not allowed",
        ));
    }

    let mut stream = provider.open(uri).await?;
    let sums = checksum_reader(&mut stream)
        .await
        .map_err(TransferError::from)?;
    drop(stream);

    let method = match compare(uri, expected, Some(&sums.md5), Some(&sums.sha512), Some(sums.size))? {
        Comparison::Matched => VerifyMethod::FetchedChecksum,
        Comparison::NoChecksumCompared if expected.size.is_some() => {
            VerifyMethod::EmptyChecksumLength
        }
        Comparison::NoChecksumCompared => {
            return Err(VerifyError::mismatch(uri, "nothing recorded to compare against"));
        }
    };
    debug!(%uri, ?method, size = sums.size, "fetched content verified");
    Ok(Observed {
        method,
        md5: Some(sums.md5),
        sha512: Some(sums.sha512),
        length: Some(sums.size),
        content_type: Some(sums.content_type),
    })
}

pub(crate) fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.as_deref().is_none_or(str::is_empty)
        && let Some(value) = value
    {
        *slot = Some(value);
    }
}

/// Confirms stored replicas against their file records.
#[derive(Clone)]
pub struct ReplicaVerifier {
    registry: Arc<ProviderRegistry>,
}

impl ReplicaVerifier {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn require_checksum(&self, location: &str, options: VerifyOptions) -> Result<bool, TransferError> {
        let loc = self
            .registry
            .location(location)
            .ok_or_else(|| TransferError::Configuration(format!("unknown location {location:?}")))?;
        Ok(options.require_checksum.unwrap_or(!loc.trust_length()))
    }

    pub(crate) async fn observe(
        &self,
        location: &str,
        uri: &Url,
        expected: &Expected,
        options: VerifyOptions,
    ) -> Result<Observed, VerifyError> {
        let require = self.require_checksum(location, options)?;
        let provider = self
            .registry
            .provider(location)
            .ok_or_else(|| TransferError::Configuration(format!("unknown location {location:?}")))?;
        verify_uri(provider, uri, expected, require, options.allow_empty_checksums).await
    }

    /// Verifies `replica` against `file`.
    ///
    /// On success the replica is marked verified and any size, checksum or
    /// content type missing from `file` is filled in from what was observed.
    /// On failure the replica is left unverified.
    pub async fn verify(
        &self,
        file: &mut FileRecord,
        replica: &mut Replica,
        options: VerifyOptions,
    ) -> Result<VerifyMethod, VerifyError> {
        replica.verified = false;
        let uri = self.registry.resolve(&replica.location, &replica.uri)?;
        let expected = Expected::from(&*file);

        let observed = match self.observe(&replica.location, &uri, &expected, options).await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(file = file.id, %uri, error = %e, "replica verification failed");
                return Err(e);
            }
        };

        if file.size.is_none() {
            file.size = observed.length;
        }
        fill(&mut file.md5, observed.md5);
        fill(&mut file.sha512, observed.sha512);
        fill(&mut file.content_type, observed.content_type);
        replica.verified = true;
        info!(file = file.id, %uri, method = ?observed.method, "replica verified");
        Ok(observed.method)
    }

    /// Answers whether the object at `uri_or_path` matches `expected`
    /// without touching any record. Transport failures are errors; a
    /// mismatch is an unverified report.
    pub async fn check(
        &self,
        location: &str,
        uri_or_path: &str,
        expected: &Expected,
        options: VerifyOptions,
    ) -> Result<VerificationReport, TransferError> {
        let uri = self.registry.resolve(location, uri_or_path)?;
        match self.observe(location, &uri, expected, options).await {
            Ok(observed) => Ok(VerificationReport {
                verified: true,
                method: Some(observed.method),
                detail: match observed.method {
                    VerifyMethod::RemoteChecksum => "remote checksum matched".into(),
                    VerifyMethod::TrustedLength => "length matched, checksum not compared".into(),
                    VerifyMethod::FetchedChecksum => "content checksum matched".into(),
                    VerifyMethod::EmptyChecksumLength => {
                        "length matched, no checksums recorded".into()
                    }
                },
            }),
            Err(VerifyError::Mismatch { reason, .. }) => Ok(VerificationReport {
                verified: false,
                method: None,
                detail: reason,
            }),
            Err(VerifyError::Transfer(e)) => Err(e),
        }
    }
}
