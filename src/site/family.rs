//! Site family policy and the family registry.
//!
//! A [`Family`] groups related sites (one per language code) and carries
//! the policy the engine needs at the wire boundary: hostnames, script
//! path, and SSL availability. Families are produced
//! by an injectable loader through a [`FamilyRegistry`] with once-only
//! construction per name; there is no ambient global table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Family lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum FamilyError {
    /// The loader does not know this family name.
    #[error("unknown family: {0}")]
    UnknownFamily(String),

    /// The family has no site for this code.
    #[error("code {code} does not exist in family {family}")]
    UnknownCode {
        /// Family name.
        family: String,
        /// Site code.
        code: String,
    },
}

/// Static policy shared by all sites of one wiki family.
#[derive(Debug, Clone)]
pub struct Family {
    name: String,
    hosts: HashMap<String, String>,
    script_path: String,
    ssl_available: bool,
}

impl Family {
    /// Create a family with the default script path.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: HashMap::new(),
            script_path: "/w".to_string(),
            ssl_available: false,
        }
    }

    /// Register a hostname for a site code.
    pub fn with_host(mut self, code: impl Into<String>, host: impl Into<String>) -> Self {
        self.hosts.insert(code.into(), host.into());
        self
    }

    /// Override the script path (default `/w`).
    pub fn with_script_path(mut self, path: impl Into<String>) -> Self {
        self.script_path = path.into();
        self
    }

    /// Mark the family as reachable over HTTPS.
    pub fn with_ssl(mut self, available: bool) -> Self {
        self.ssl_available = available;
        self
    }

    /// Family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname for a site code.
    pub fn hostname(&self, code: &str) -> Result<&str, FamilyError> {
        self.hosts
            .get(code)
            .map(|s| s.as_str())
            .ok_or_else(|| FamilyError::UnknownCode {
                family: self.name.clone(),
                code: code.to_string(),
            })
    }

    /// Path prefix of the API script.
    pub fn script_path(&self) -> &str {
        &self.script_path
    }

    /// Whether secure transport is available for this family.
    pub fn ssl_available(&self) -> bool {
        self.ssl_available
    }
}

/// Loader callback producing a family definition by name.
pub type FamilyLoader = Box<dyn Fn(&str) -> Result<Family, FamilyError> + Send + Sync>;

/// Lazily constructs and caches families by name, once per name.
///
/// Owned by the application context rather than living in a process-wide
/// static, so tests and embedders can supply their own loaders.
pub struct FamilyRegistry {
    loader: FamilyLoader,
    cache: Mutex<HashMap<String, Arc<Family>>>,
}

impl FamilyRegistry {
    /// Create a registry with an injectable loader.
    pub fn new(loader: FamilyLoader) -> Self {
        Self {
            loader,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a family, constructing it on first use.
    ///
    /// The loader runs under the registry lock, so exactly one
    /// construction happens per name even under concurrent lookups.
    pub fn get(&self, name: &str) -> Result<Arc<Family>, FamilyError> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(family) = cache.get(name) {
            return Ok(family.clone());
        }
        debug!(family = name, "Loading family definition");
        let family = Arc::new((self.loader)(name)?);
        cache.insert(name.to_string(), family.clone());
        Ok(family)
    }
}
