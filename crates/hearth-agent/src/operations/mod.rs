//! Provisioning steps.
//!
//! Each step kind has a factory registered under a string key. Factories
//! resolve `${...}` tokens in the declared arguments, validate them into a
//! typed struct and hand back an immutable [`Operation`].

mod command;
mod download;
mod extract;
mod http;
mod mojang;
mod writefile;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock},
};

use serde::de::DeserializeOwned;

use crate::config::{AgentConfig, DEFAULT_MANIFEST_URL};
use crate::environment::Environment;
use crate::error::{OperationError, PipelineError};
use crate::tokens;

pub use command::CommandFactory;
pub use download::DownloadFactory;
pub use extract::ExtractFactory;
pub use mojang::{MojangDlFactory, VersionManifest, resolve_version};
pub use writefile::WriteFileFactory;

#[async_trait::async_trait]
pub trait Operation: Send + Sync + std::fmt::Debug {
    /// Registry key of the factory that built this operation.
    fn key(&self) -> &'static str;

    async fn run(&self, env: &Environment) -> Result<(), OperationError>;
}

pub trait OperationFactory: Send + Sync {
    fn key(&self) -> &'static str;

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError>;
}

/// One factory call's worth of input.
#[derive(Debug, Clone, Default)]
pub struct CreateOperation {
    pub operation_key: String,
    pub operation_args: serde_json::Map<String, serde_json::Value>,
    pub data_map: BTreeMap<String, String>,
}

impl CreateOperation {
    /// Substitutes tokens in every string argument, then deserializes into `T`.
    pub fn parse_args<T: DeserializeOwned>(self) -> Result<T, OperationError> {
        let mut args = serde_json::Value::Object(self.operation_args);
        tokens::substitute_all(&mut args, &self.data_map);
        serde_json::from_value(args)
            .map_err(|e| OperationError::invalid(&self.operation_key, e.to_string()))
    }
}

/// A declared step: `{"key": "...", "args": {...}}`, or flat as
/// `{"type": "...", <args>}`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(try_from = "serde_json::Map<String, serde_json::Value>")]
pub struct OperationSpec {
    pub key: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<serde_json::Map<String, serde_json::Value>> for OperationSpec {
    type Error = String;

    fn try_from(mut map: serde_json::Map<String, serde_json::Value>) -> Result<Self, Self::Error> {
        let key = match map.remove("key").or_else(|| map.remove("type")) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(_) => return Err("operation key must be a non-empty string".to_string()),
            None => return Err("operation is missing `key`".to_string()),
        };

        let args = match map.remove("args") {
            Some(serde_json::Value::Object(args)) if map.is_empty() => args,
            Some(serde_json::Value::Object(_)) => {
                return Err(format!(
                    "operation {key}: use either `args` or flat arguments, not both"
                ));
            }
            Some(_) => return Err(format!("operation {key}: `args` must be an object")),
            None => map,
        };

        Ok(Self { key, args })
    }
}

#[derive(Debug, Clone)]
pub struct OperationSettings {
    pub minecraft_manifest_url: String,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            minecraft_manifest_url: DEFAULT_MANIFEST_URL.to_string(),
        }
    }
}

impl OperationSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            minecraft_manifest_url: cfg.minecraft_manifest_url.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    factories: HashMap<&'static str, Arc<dyn OperationFactory>>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl OperationRegistry {
    pub fn with_builtins(settings: &OperationSettings) -> Self {
        let mut reg = Self::default();
        reg.register(MojangDlFactory::new(settings.minecraft_manifest_url.clone()));
        reg.register(DownloadFactory);
        reg.register(WriteFileFactory);
        reg.register(ExtractFactory);
        reg.register(CommandFactory);
        reg
    }

    /// Adds or replaces the factory for its key.
    pub fn register(&mut self, factory: impl OperationFactory + 'static) {
        self.factories.insert(factory.key(), Arc::new(factory));
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.factories.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError> {
        let factory = self
            .factories
            .get(op.operation_key.as_str())
            .ok_or_else(|| OperationError::UnknownOperation(op.operation_key.clone()))?;
        factory.create(op)
    }

    /// Builds every step up front so an unknown key or bad argument fails
    /// before anything runs.
    pub fn build(
        &self,
        specs: &[OperationSpec],
        data_map: &BTreeMap<String, String>,
    ) -> Result<Vec<Box<dyn Operation>>, PipelineError> {
        specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                self.create(CreateOperation {
                    operation_key: spec.key.clone(),
                    operation_args: spec.args.clone(),
                    data_map: data_map.clone(),
                })
                .map_err(|source| PipelineError {
                    index,
                    key: spec.key.clone(),
                    source,
                })
            })
            .collect()
    }
}

static GLOBAL: OnceLock<OperationRegistry> = OnceLock::new();

/// Installs the process-wide registry. Fails (returning it) if one is
/// already installed or [`global`] was already used.
pub fn install_global(registry: OperationRegistry) -> Result<(), OperationRegistry> {
    GLOBAL.set(registry)
}

/// The process-wide registry; built-ins with default settings unless
/// [`install_global`] ran first.
pub fn global() -> &'static OperationRegistry {
    GLOBAL.get_or_init(|| OperationRegistry::with_builtins(&OperationSettings::default()))
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub(crate) fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}
