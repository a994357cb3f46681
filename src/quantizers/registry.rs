use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{de::Error as _, Deserialize, Serialize};

use super::configs::{
    BackendConfig, BitsAndBytesConfig, CustomQuantConfig, GgufQuantizationConfig, QuantConfig,
    QuantoConfig, TorchAoConfig,
};
use super::error::{AvailableBackends, QuantError, QuantResult, Scope};
use crate::utils;

/// The library a registry (and a model component) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrySource {
    Diffusers,
    Transformers,
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrySource::Diffusers => write!(f, "diffusers"),
            RegistrySource::Transformers => write!(f, "transformers"),
        }
    }
}

pub type ConfigConstructor = fn(&str, toml::Table) -> Result<QuantConfig, toml::de::Error>;

fn construct<T: BackendConfig>(
    _backend: &str,
    kwargs: toml::Table,
) -> Result<QuantConfig, toml::de::Error> {
    let config: T = toml::Value::Table(kwargs).try_into()?;
    config.post_init().map_err(toml::de::Error::custom)?;
    Ok(config.into())
}

fn construct_custom(backend: &str, kwargs: toml::Table) -> Result<QuantConfig, toml::de::Error> {
    Ok(QuantConfig::Custom(CustomQuantConfig { backend: backend.to_string(), params: kwargs }))
}

/// A backend name bound to a config class and the parameters it accepts.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    name: String,
    class_name: String,
    params: BTreeSet<String>,
    constructor: ConfigConstructor,
}

impl BackendEntry {
    pub fn of<T: BackendConfig>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            class_name: T::CLASS_NAME.to_string(),
            params: T::PARAMS.iter().map(|p| p.to_string()).collect(),
            constructor: construct::<T>,
        }
    }

    /// An entry whose instances keep their arguments verbatim.
    pub fn custom(name: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            class_name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            constructor: construct_custom,
        }
    }

    /// Declares additional accepted parameters.
    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params.extend(params.iter().map(|p| p.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn params(&self) -> &BTreeSet<String> {
        &self.params
    }

    pub fn instantiate(&self, kwargs: &toml::Table, scope: Scope) -> QuantResult<QuantConfig> {
        let invalid = |source| QuantError::InvalidBackendArguments {
            scope: scope.clone(),
            backend: self.name.clone(),
            source,
        };
        if let Some(unknown) = kwargs.keys().find(|k| !self.params.contains(*k)) {
            return Err(invalid(toml::de::Error::custom(format!(
                "unexpected keyword argument `{unknown}` for {}, accepted ones are: {:?}",
                self.class_name, self.params
            ))));
        }
        let config = (self.constructor)(&self.name, kwargs.clone()).map_err(invalid)?;
        tracing::debug!(
            backend = %self.name,
            class = %self.class_name,
            "initialized quantization config {scope}"
        );
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    source: RegistrySource,
    entries: BTreeMap<String, BackendEntry>,
}

impl BackendRegistry {
    pub fn new(source: RegistrySource) -> Self {
        Self { source, entries: BTreeMap::new() }
    }

    /// Built-in diffusers config classes.
    pub fn diffusers() -> Self {
        Self::new(RegistrySource::Diffusers)
            .register(BackendEntry::of::<BitsAndBytesConfig>("bitsandbytes_4bit"))
            .register(BackendEntry::of::<BitsAndBytesConfig>("bitsandbytes_8bit"))
            .register(BackendEntry::of::<GgufQuantizationConfig>("gguf"))
            .register(BackendEntry::of::<QuantoConfig>("quanto"))
            .register(BackendEntry::of::<TorchAoConfig>("torchao"))
    }

    /// Built-in transformers config classes.
    pub fn transformers() -> Self {
        Self::new(RegistrySource::Transformers)
            .register(BackendEntry::of::<BitsAndBytesConfig>("bitsandbytes_4bit"))
            .register(BackendEntry::of::<BitsAndBytesConfig>("bitsandbytes_8bit"))
            .register(BackendEntry::of::<QuantoConfig>("quanto"))
            .register(
                BackendEntry::of::<TorchAoConfig>("torchao")
                    .with_params(&["include_input_output_embeddings", "untie_embedding_weights"]),
            )
    }

    pub fn register(mut self, entry: BackendEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn insert(&mut self, entry: BackendEntry) -> Option<BackendEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    pub fn source(&self) -> RegistrySource {
        self.source
    }

    pub fn get(&self, backend: &str) -> Option<&BackendEntry> {
        self.entries.get(backend)
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.entries.contains_key(backend)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static BUILTIN: Lazy<Arc<Registries>> = Lazy::new(|| {
    let transformers = utils::is_transformers_available().then(BackendRegistry::transformers);
    Arc::new(Registries::new(BackendRegistry::diffusers(), transformers))
});

/// The registries a plan validates and resolves against.
#[derive(Debug, Clone)]
pub struct Registries {
    diffusers: BackendRegistry,
    transformers: Option<BackendRegistry>,
}

impl Registries {
    pub fn new(diffusers: BackendRegistry, transformers: Option<BackendRegistry>) -> Self {
        Self { diffusers, transformers }
    }

    /// Shared built-in registries; transformers is present iff its feature is on.
    pub fn builtin() -> Arc<Self> {
        BUILTIN.clone()
    }

    pub fn diffusers(&self) -> &BackendRegistry {
        &self.diffusers
    }

    pub fn transformers(&self) -> Option<&BackendRegistry> {
        self.transformers.as_ref()
    }

    pub fn is_transformers_available(&self) -> bool {
        self.transformers.is_some()
    }

    pub fn get(&self, source: RegistrySource) -> Option<&BackendRegistry> {
        match source {
            RegistrySource::Diffusers => Some(&self.diffusers),
            RegistrySource::Transformers => self.transformers.as_ref(),
        }
    }

    /// Transformers first (when present), then diffusers.
    pub fn consulted(&self) -> impl Iterator<Item = &BackendRegistry> {
        self.transformers.iter().chain(std::iter::once(&self.diffusers))
    }

    pub fn available_backends(&self) -> AvailableBackends {
        AvailableBackends(self.consulted().map(|r| (r.source(), r.names())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(src: &str) -> toml::Table {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn test_builtin_registries() {
        let diffusers = BackendRegistry::diffusers();
        assert_eq!(diffusers.source(), RegistrySource::Diffusers);
        assert_eq!(
            diffusers.names(),
            vec!["bitsandbytes_4bit", "bitsandbytes_8bit", "gguf", "quanto", "torchao"]
        );
        let transformers = BackendRegistry::transformers();
        assert!(!transformers.contains("gguf"));
        assert_eq!(transformers.len(), 4);
    }

    #[test]
    fn test_torchao_schemas_diverge() {
        let d = BackendRegistry::diffusers();
        let t = BackendRegistry::transformers();
        let d = d.get("torchao").unwrap().params();
        let t = t.get("torchao").unwrap().params();
        assert_ne!(d, t);
        assert!(t.is_superset(d));
    }

    #[test]
    fn test_instantiate_typed_entry() {
        let registry = BackendRegistry::diffusers();
        let entry = registry.get("bitsandbytes_8bit").unwrap();
        let config = entry.instantiate(&kwargs("load_in_8bit = true"), Scope::default()).unwrap();
        match config {
            QuantConfig::BitsAndBytes(c) => assert_eq!(c.bits(), Some(8)),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_instantiate_rejects_undeclared_param() {
        let registry = BackendRegistry::diffusers();
        let entry = registry.get("torchao").unwrap();
        let kwargs = kwargs("quant_type = \"int8wo\"\nuntie_embedding_weights = true");
        let err = entry.instantiate(&kwargs, Scope::module("unet")).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, QuantError::InvalidBackendArguments { .. }));
        assert!(msg.starts_with("Module 'unet': "), "{msg}");
        assert!(msg.contains("untie_embedding_weights"), "{msg}");
    }

    #[test]
    fn test_instantiate_runs_post_init() {
        let registry = BackendRegistry::diffusers();
        let entry = registry.get("bitsandbytes_4bit").unwrap();
        let err = entry
            .instantiate(&kwargs("load_in_4bit = true\nload_in_8bit = true"), Scope::default())
            .unwrap_err();
        assert!(matches!(err, QuantError::InvalidBackendArguments { .. }));
    }

    #[test]
    fn test_custom_entry_keeps_arguments() {
        let registry = BackendRegistry::new(RegistrySource::Diffusers)
            .register(BackendEntry::custom("int8", &["bits"]));
        let entry = registry.get("int8").unwrap();
        let config = entry.instantiate(&kwargs("bits = 8"), Scope::default()).unwrap();
        match config {
            QuantConfig::Custom(c) => {
                assert_eq!(c.backend, "int8");
                assert_eq!(c.get("bits"), Some(&toml::Value::Integer(8)));
            }
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn test_registries_consultation_order() {
        let registries =
            Registries::new(BackendRegistry::diffusers(), Some(BackendRegistry::transformers()));
        assert!(registries.is_transformers_available());
        let available = registries.available_backends();
        assert_eq!(available.0[0].0, RegistrySource::Transformers);
        assert_eq!(available.names(RegistrySource::Diffusers).unwrap().len(), 5);

        let registries = Registries::new(BackendRegistry::diffusers(), None);
        assert!(registries.get(RegistrySource::Transformers).is_none());
        assert_eq!(registries.available_backends().0.len(), 1);
    }

    #[test]
    fn test_builtin_follows_features() {
        assert_eq!(
            Registries::builtin().is_transformers_available(),
            utils::is_transformers_available()
        );
    }
}
