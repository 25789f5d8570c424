use percent_encoding::percent_decode_str;
use url::Url;

use crate::{TransferError, validate_relative_path};

/// The base URI of a Location.
///
/// The path always ends with `/`, so `contains` is a plain prefix test on
/// whole segments: `file:///data/store/` never contains `file:///data/store2/x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUri {
    url: Url,
}

impl BaseUri {
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        let mut url = Url::parse(raw)
            .map_err(|e| TransferError::Configuration(format!("malformed base URI {raw:?}: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(TransferError::Configuration(format!(
                "base URI {raw:?} cannot hold paths"
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(TransferError::Configuration(format!(
                "base URI {raw:?} must not carry a query or fragment"
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Self { url })
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Returns `true` if `uri` names an object strictly below this base.
    pub fn contains(&self, uri: &Url) -> bool {
        uri.scheme() == self.url.scheme()
            && uri.host_str() == self.url.host_str()
            && uri.port_or_known_default() == self.url.port_or_known_default()
            && uri.username() == self.url.username()
            && self
                .relativize(uri)
                .is_some_and(|rel| validate_relative_path(&rel).is_ok())
    }

    /// Fails with [`TransferError::Protocol`] unless `uri` lies under this base.
    pub fn check(&self, uri: &Url) -> Result<(), TransferError> {
        if self.contains(uri) {
            Ok(())
        } else {
            Err(TransferError::Protocol(format!(
                "{uri} is outside base {}",
                self.url
            )))
        }
    }

    /// Joins a Location-relative path onto the base.
    pub fn join(&self, relative: &str) -> Result<Url, TransferError> {
        validate_relative_path(relative)?;
        let mut url = self.url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| TransferError::InvalidPath(format!("cannot join onto {}", self.url)))?;
            segments.pop_if_empty();
            segments.extend(relative.split('/').filter(|s| !s.is_empty() && *s != "."));
        }
        Ok(url)
    }

    /// Inverse of [`join`](Self::join): the decoded path below the base,
    /// or `None` if `uri` is not below it.
    pub fn relativize(&self, uri: &Url) -> Option<String> {
        let rest = uri.path().strip_prefix(self.url.path())?;
        if rest.is_empty() {
            return None;
        }
        let mut parts = Vec::new();
        for segment in rest.split('/') {
            parts.push(percent_decode_str(segment).decode_utf8().ok()?.into_owned());
        }
        Some(parts.join("/"))
    }

    /// Parses a fully-qualified URI or joins a bare relative path.
    pub fn resolve(&self, uri_or_path: &str) -> Result<Url, TransferError> {
        match Url::parse(uri_or_path) {
            Ok(url) => {
                self.check(&url)?;
                Ok(url)
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => self.join(uri_or_path),
            Err(e) => Err(TransferError::InvalidPath(format!("{uri_or_path:?}: {e}"))),
        }
    }
}

/// Sibling name used for the `attempt`-th collision: `a.txt` becomes `a_1.txt`.
pub fn disambiguate(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{attempt}.{ext}"),
        _ => format!("{name}_{attempt}"),
    }
}

/// `target` with its final segment disambiguated for `attempt`.
pub(crate) fn candidate(target: &Url, attempt: u32) -> Result<Url, TransferError> {
    if attempt == 0 {
        return Ok(target.clone());
    }
    let last = target
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransferError::InvalidPath(format!("{target} has no file name")))?;
    let name = percent_decode_str(last)
        .decode_utf8()
        .map_err(|_| TransferError::InvalidPath(format!("{target} is not UTF-8")))?;
    let renamed = disambiguate(&name, attempt);

    let mut url = target.clone();
    url.path_segments_mut()
        .map_err(|()| TransferError::InvalidPath(format!("{target} cannot hold paths")))?
        .pop()
        .push(&renamed);
    Ok(url)
}

/// Decoded path component of `uri`.
pub(crate) fn decoded_path(uri: &Url) -> Result<String, TransferError> {
    percent_decode_str(uri.path())
        .decode_utf8()
        .map(|p| p.into_owned())
        .map_err(|_| TransferError::InvalidPath(format!("{uri} is not UTF-8")))
}
