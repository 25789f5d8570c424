use tardis_checksum::HashingReader;
use tardis_model::{FileRecord, Replica};
use tracing::{info, warn};

use crate::verify::{Expected, VerifyError, VerifyOptions, fill};
use crate::{ReplicaVerifier, TransferError, TransferProvider, Upload};

/// Copies verified replicas between Locations.
///
/// The new copy is verified before it is returned; a copy that fails
/// verification is removed again.
#[derive(Clone)]
pub struct ReplicaCopier {
    verifier: ReplicaVerifier,
}

impl ReplicaCopier {
    pub fn new(verifier: ReplicaVerifier) -> Self {
        Self { verifier }
    }

    /// Streams `source` into `destination` and returns the verified replica.
    ///
    /// The target path is `<dataset id>/<directory>/<filename>` below the
    /// destination base, disambiguated by the provider on collision.
    pub async fn copy(
        &self,
        file: &mut FileRecord,
        source: &Replica,
        destination: &str,
        options: VerifyOptions,
    ) -> Result<Replica, VerifyError> {
        if !source.verified {
            return Err(TransferError::Protocol(format!(
                "replica {} of file {} is not verified",
                source.uri, file.id
            ))
            .into());
        }
        let registry = self.verifier.registry();
        let src_provider = registry
            .provider(&source.location)
            .ok_or_else(|| TransferError::Configuration(format!("unknown location {:?}", source.location)))?;
        let dst_provider = registry
            .provider(destination)
            .ok_or_else(|| TransferError::Configuration(format!("unknown location {destination:?}")))?;
        let dst_location = registry
            .location(destination)
            .ok_or_else(|| TransferError::Configuration(format!("unknown location {destination:?}")))?;

        let src_uri = registry.resolve(&source.location, &source.uri)?;
        let target = dst_provider
            .base()
            .join(&format!("{}/{}", file.dataset_id, file.relative_path()))?;

        let stream = src_provider.open(&src_uri).await?;
        let (reader, sent) = HashingReader::new(stream);
        let stored = dst_provider
            .store(Upload::new(Box::pin(reader), file.size), &target)
            .await?;

        // Without recorded checksums the copy is checked against the bytes
        // that were actually sent.
        let sums = sent.snapshot();
        let mut expected = Expected::from(&*file);
        if !expected.has_checksums() {
            expected.md5 = Some(sums.md5.clone());
            expected.sha512 = Some(sums.sha512.clone());
            expected.size = expected.size.or(Some(sums.size));
        }

        if let Err(e) = self
            .verifier
            .observe(destination, &stored, &expected, options)
            .await
        {
            warn!(file = file.id, uri = %stored, error = %e, "copy failed verification, removing");
            if let Err(cleanup) = dst_provider.remove(&stored).await {
                warn!(uri = %stored, error = %cleanup, "failed to remove unverified copy");
            }
            return Err(e);
        }

        if file.size.is_none() {
            file.size = Some(sums.size);
        }
        fill(&mut file.md5, Some(sums.md5));
        fill(&mut file.sha512, Some(sums.sha512));
        fill(&mut file.content_type, Some(sums.content_type));

        let uri = registry
            .relativize(destination, &stored)
            .unwrap_or_else(|| stored.to_string());
        let mut replica = Replica::new(file.id, destination, &uri, &dst_location.provider);
        replica.verified = true;
        info!(file = file.id, from = %source.location, to = %destination, %uri, "replica copied");
        Ok(replica)
    }

    /// Copies `source` to `destination` and removes the source copy once
    /// the new one is verified.
    pub async fn migrate(
        &self,
        file: &mut FileRecord,
        source: &Replica,
        destination: &str,
        options: VerifyOptions,
    ) -> Result<Replica, VerifyError> {
        let replica = self.copy(file, source, destination, options).await?;
        let registry = self.verifier.registry();
        let src_uri = registry.resolve(&source.location, &source.uri)?;
        if let Some(provider) = registry.provider(&source.location) {
            provider.remove(&src_uri).await?;
        }
        Ok(replica)
    }
}
