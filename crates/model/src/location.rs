use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named storage endpoint bound to exactly one transfer provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    /// Provider tag: `local`, `http`, `scp`, or a registered custom tag.
    pub provider: String,
    pub base_uri: String,
    #[serde(default = "default_online")]
    pub online: bool,
    /// Higher values are preferred when several Locations are online.
    #[serde(default)]
    pub priority: i32,
    /// Provider-specific parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

fn default_online() -> bool {
    true
}

impl Location {
    /// Creates an online Location with no parameters.
    pub fn new(name: &str, provider: &str, base_uri: &str) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            base_uri: base_uri.into(),
            online: true,
            priority: 0,
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns a parameter value, treating empty strings as unset.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Returns a boolean parameter (`true`/`1`/`yes`/`on`), defaulting to `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.param(key).is_some_and(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )
        })
    }

    /// Whether a length match is accepted when no checksum can be compared.
    pub fn trust_length(&self) -> bool {
        self.flag("trust_length")
    }
}
