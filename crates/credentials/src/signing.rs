//! Client for the OAuth-protected certificate-signing service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tardis_model::{RemoteHost, Secret};
use tracing::debug;
use url::Url;

use crate::CredentialError;

#[derive(Serialize)]
struct SignRequest<'a> {
    public_key: &'a str,
    remote_user: &'a str,
    host: &'a str,
}

#[derive(Deserialize)]
struct SignResponse {
    certificate: String,
}

/// Turns an ephemeral public key into a short-lived OpenSSH certificate.
pub struct CertificateSigner {
    http: reqwest::Client,
    sign_url: Url,
    authorize_url: Option<Url>,
}

impl CertificateSigner {
    pub fn new(
        sign_url: &str,
        authorize_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let parse = |raw: &str| {
            Url::parse(raw).map_err(|e| CredentialError::Signing(format!("bad URL {raw:?}: {e}")))
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        Ok(Self {
            http,
            sign_url: parse(sign_url)?,
            authorize_url: authorize_url.map(parse).transpose()?,
        })
    }

    /// Where a user is sent to obtain an OAuth token for `host`.
    pub fn authorization_url(&self, host: &RemoteHost, state: &str) -> Option<Url> {
        let mut url = self.authorize_url.clone()?;
        url.query_pairs_mut()
            .append_pair("host", &host.name)
            .append_pair("state", state);
        Some(url)
    }

    /// Asks the service to sign `public_key` for `remote_user` on `host`.
    pub async fn sign(
        &self,
        public_key: &str,
        remote_user: &str,
        host: &RemoteHost,
        token: &Secret,
    ) -> Result<String, CredentialError> {
        let response = self
            .http
            .post(self.sign_url.clone())
            .bearer_auth(token.expose())
            .json(&SignRequest {
                public_key,
                remote_user,
                host: &host.hostname,
            })
            .send()
            .await
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Signing(format!("{status}: {body}")));
        }
        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        if signed.certificate.trim().is_empty() {
            return Err(CredentialError::Signing("empty certificate".into()));
        }
        debug!(host = %host.name, %remote_user, "certificate issued");
        Ok(signed.certificate)
    }
}
