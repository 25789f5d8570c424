use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tardis_model::Location;
use tracing::{info, warn};
use url::Url;

use crate::providers::{HttpProvider, LocalProvider, ScpProvider};
use crate::{
    BaseUri, BoxFuture, ByteStream, DEFAULT_OPERATION_TIMEOUT, Probe, RemoteMetadata,
    TransferError, TransferProvider, Upload,
};

const BUILTIN_TAGS: [&str; 3] = ["local", "http", "scp"];

/// Object name looked up by [`ProviderRegistry::probe`].
const PROBE_NAME: &str = ".tardis-probe";

/// Builds a custom provider for a Location with a registered tag.
pub type CustomFactory =
    Box<dyn Fn(&Location, Duration) -> Result<Arc<dyn TransferProvider>, TransferError> + Send + Sync>;

/// The closed set of backends a Location can be bound to.
pub enum Provider {
    Local(LocalProvider),
    Http(HttpProvider),
    Scp(ScpProvider),
    Custom(Arc<dyn TransferProvider>),
}

impl Provider {
    fn inner(&self) -> &dyn TransferProvider {
        match self {
            Self::Local(p) => p,
            Self::Http(p) => p,
            Self::Scp(p) => p,
            Self::Custom(p) => p.as_ref(),
        }
    }
}

impl TransferProvider for Provider {
    fn base(&self) -> &BaseUri {
        self.inner().base()
    }

    fn length<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<Probe<u64>, TransferError>> {
        self.inner().length(uri)
    }

    fn metadata<'a>(
        &'a self,
        uri: &'a Url,
    ) -> BoxFuture<'a, Result<Probe<RemoteMetadata>, TransferError>> {
        self.inner().metadata(uri)
    }

    fn open<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<ByteStream, TransferError>> {
        self.inner().open(uri)
    }

    fn store<'a>(
        &'a self,
        upload: Upload,
        target: &'a Url,
    ) -> BoxFuture<'a, Result<Url, TransferError>> {
        self.inner().store(upload, target)
    }

    fn remove<'a>(&'a self, uri: &'a Url) -> BoxFuture<'a, Result<(), TransferError>> {
        self.inner().remove(uri)
    }
}

/// Collects custom provider tags and settings before the registry is built.
pub struct RegistryBuilder {
    custom: HashMap<String, CustomFactory>,
    timeout: Duration,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            custom: HashMap::new(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Bound applied to every provider operation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Registers a factory for Locations whose provider is `tag`.
    pub fn register_custom(mut self, tag: &str, factory: CustomFactory) -> Result<Self, TransferError> {
        if BUILTIN_TAGS.contains(&tag) {
            return Err(TransferError::Configuration(format!(
                "custom provider tag {tag:?} shadows a built-in provider"
            )));
        }
        if self.custom.insert(tag.to_string(), factory).is_some() {
            return Err(TransferError::Configuration(format!(
                "custom provider tag {tag:?} registered twice"
            )));
        }
        Ok(self)
    }

    /// Instantiates one provider per Location.
    ///
    /// Unknown provider tags, malformed base URIs and duplicate names all
    /// fail here so that a bad configuration never reaches a transfer.
    pub fn build(self, locations: &[Location]) -> Result<ProviderRegistry, TransferError> {
        let mut entries: Vec<Entry> = Vec::with_capacity(locations.len());
        for location in locations {
            if entries.iter().any(|e| e.location.name == location.name) {
                return Err(TransferError::Configuration(format!(
                    "duplicate location name {:?}",
                    location.name
                )));
            }
            let provider = match location.provider.as_str() {
                "local" => Provider::Local(LocalProvider::from_location(location)?),
                "http" => Provider::Http(HttpProvider::from_location(location, self.timeout)?),
                "scp" => Provider::Scp(ScpProvider::from_location(location, self.timeout)?),
                tag => match self.custom.get(tag) {
                    Some(factory) => Provider::Custom(factory(location, self.timeout)?),
                    None => {
                        return Err(TransferError::Configuration(format!(
                            "location {:?}: unknown provider {tag:?}",
                            location.name
                        )));
                    }
                },
            };
            info!(location = %location.name, provider = %location.provider, base = %provider.base().as_url(), "registered location");
            entries.push(Entry {
                location: location.clone(),
                provider,
            });
        }
        Ok(ProviderRegistry { entries })
    }
}

struct Entry {
    location: Location,
    provider: Provider,
}

/// Every configured Location with its provider, built once at start-up.
pub struct ProviderRegistry {
    entries: Vec<Entry>,
}

impl ProviderRegistry {
    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.location.name == name)
    }

    fn require(&self, name: &str) -> Result<&Entry, TransferError> {
        self.entry(name)
            .ok_or_else(|| TransferError::Configuration(format!("unknown location {name:?}")))
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.entries.iter().map(|e| &e.location)
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        self.entry(name).map(|e| &e.location)
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.entry(name).map(|e| &e.provider)
    }

    /// Turns a stored replica URI (full or Location-relative) into a full URI.
    pub fn resolve(&self, location: &str, uri_or_path: &str) -> Result<Url, TransferError> {
        self.require(location)?.provider.base().resolve(uri_or_path)
    }

    /// Location-relative form of `uri`, if it lies under `location`.
    pub fn relativize(&self, location: &str, uri: &Url) -> Option<String> {
        let base = self.entry(location)?.provider.base();
        if base.contains(uri) {
            base.relativize(uri)
        } else {
            None
        }
    }

    /// The Location whose base URI is the longest prefix of `uri`.
    pub fn location_for_uri(&self, uri: &Url) -> Option<&Location> {
        self.entries
            .iter()
            .filter(|e| e.provider.base().contains(uri))
            .max_by_key(|e| e.provider.base().as_url().path().len())
            .map(|e| &e.location)
    }

    /// Highest-priority online Location among `candidates`; the earliest
    /// candidate wins a tie.
    pub fn best_online<'a, I>(&self, candidates: I) -> Option<&Location>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<&Location> = None;
        for name in candidates {
            let Some(location) = self.location(name) else {
                continue;
            };
            if !location.online {
                continue;
            }
            if best.is_none_or(|b| location.priority > b.priority) {
                best = Some(location);
            }
        }
        best
    }

    /// Checks whether a Location answers at all. A missing object still
    /// counts as alive; only a transport error marks it offline.
    pub async fn probe(&self, name: &str) -> Result<bool, TransferError> {
        let entry = self.require(name)?;
        let sentinel = entry.provider.base().join(PROBE_NAME)?;
        match entry.provider.length(&sentinel).await {
            Ok(Probe::Found(_) | Probe::Missing) => Ok(true),
            Err(e) => {
                warn!(location = %name, error = %e, "location probe failed");
                Ok(false)
            }
        }
    }
}
