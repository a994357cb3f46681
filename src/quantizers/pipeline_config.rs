use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use super::configs::QuantConfig;
use super::error::{AvailableBackends, QuantError, QuantResult, Scope};
use super::registry::{BackendRegistry, Registries, RegistrySource};
use crate::pipelines::PipelineDescriptor;
use crate::utils;

/// Backend assignment for a single module in granular mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleQuantSpec {
    pub backend: String,
    #[serde(default)]
    pub backend_kwargs: toml::Table,
}

impl ModuleQuantSpec {
    pub fn new(backend: &str, backend_kwargs: toml::Table) -> Self {
        Self { backend: backend.to_string(), backend_kwargs }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|v| match v {
        OneOrMany::One(module) => vec![module],
        OneOrMany::Many(modules) => modules,
    }))
}

/// Unvalidated user input for a [`PipelineQuantizationConfig`].
///
/// This is what a plan file deserializes into:
///
/// ```toml
/// backend = "bitsandbytes_4bit"
/// modules_to_quantize = ["unet"]
///
/// [backend_kwargs]
/// load_in_4bit = true
///
/// [mapping.text_encoder]
/// backend = "bitsandbytes_8bit"
/// backend_kwargs = { load_in_8bit = true }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineQuantizationSpec {
    pub backend: Option<String>,
    pub backend_kwargs: Option<toml::Table>,
    #[serde(deserialize_with = "one_or_many")]
    pub modules_to_quantize: Option<Vec<String>>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude_modules: Option<Vec<String>>,
    pub mapping: Option<BTreeMap<String, ModuleQuantSpec>>,
}

impl PipelineQuantizationSpec {
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    pub fn with_kwarg<V: Into<toml::Value>>(mut self, name: &str, value: V) -> Self {
        self.backend_kwargs
            .get_or_insert_with(toml::Table::new)
            .insert(name.to_string(), value.into());
        self
    }

    pub fn with_modules_to_quantize(mut self, modules: &[&str]) -> Self {
        self.modules_to_quantize = Some(modules.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_exclude_modules(mut self, modules: &[&str]) -> Self {
        self.exclude_modules = Some(modules.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn with_module(mut self, module: &str, spec: ModuleQuantSpec) -> Self {
        self.mapping.get_or_insert_with(BTreeMap::new).insert(module.to_string(), spec);
        self
    }
}

/// Which modules the default backend applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleFilter {
    /// Quantize only the listed modules.
    Include(Vec<String>),
    /// Quantize every module except the listed ones.
    Exclude(Vec<String>),
}

impl ModuleFilter {
    pub fn admits(&self, module_name: &str) -> bool {
        match self {
            ModuleFilter::Include(modules) => modules.iter().any(|m| m == module_name),
            ModuleFilter::Exclude(modules) => !modules.iter().any(|m| m == module_name),
        }
    }
}

fn non_empty(modules: Option<Vec<String>>) -> Option<Vec<String>> {
    modules.filter(|m| !m.is_empty())
}

/// Decides, per pipeline module, whether and how it gets quantized.
///
/// Validated once at construction and read-only afterwards, so a plan can be
/// shared across loader threads.
#[derive(Debug, Clone)]
pub struct PipelineQuantizationConfig {
    backend: Option<String>,
    backend_kwargs: toml::Table,
    module_filter: Option<ModuleFilter>,
    mapping: Option<BTreeMap<String, ModuleQuantSpec>>,
    registries: Arc<Registries>,
}

impl PipelineQuantizationConfig {
    pub fn new(spec: PipelineQuantizationSpec, registries: Arc<Registries>) -> QuantResult<Self> {
        let include = non_empty(spec.modules_to_quantize);
        let exclude = non_empty(spec.exclude_modules);
        let module_filter = match (include, exclude) {
            (Some(_), Some(_)) => return Err(QuantError::ConflictingModuleFilters),
            (Some(modules), None) => Some(ModuleFilter::Include(modules)),
            (None, Some(modules)) => Some(ModuleFilter::Exclude(modules)),
            (None, None) => None,
        };
        let config = Self {
            backend: spec.backend,
            backend_kwargs: spec.backend_kwargs.unwrap_or_default(),
            module_filter,
            mapping: spec.mapping,
            registries,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_builtin_registries(spec: PipelineQuantizationSpec) -> QuantResult<Self> {
        Self::new(spec, Registries::builtin())
    }

    pub fn from_file<T: AsRef<Path>>(path: T, registries: Arc<Registries>) -> QuantResult<Self> {
        let file = utils::read_config_file(&path)?;
        let spec: PipelineQuantizationSpec =
            toml::from_str(&file).map_err(|source| QuantError::ParseConfig {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
        Self::new(spec, registries)
    }

    fn validate(&self) -> QuantResult<()> {
        if !self.is_granular() && self.backend.is_none() {
            return Err(QuantError::MissingBackend);
        }
        if self.backend_kwargs.is_empty() && self.mapping.is_none() {
            return Err(QuantError::EmptyConfiguration);
        }
        if self.mapping.as_ref().is_some_and(|m| m.is_empty()) {
            return Err(QuantError::EmptyMapping);
        }
        if self.module_filter.is_some() && self.backend.is_none() {
            return Err(QuantError::FilterWithoutBackend);
        }
        if let Some(backend) = &self.backend {
            self.validate_backend(backend)?;
        }
        if let Some(mapping) = &self.mapping {
            self.validate_mapping(mapping)?;
        }
        Ok(())
    }

    fn validate_backend(&self, backend: &str) -> QuantResult<()> {
        let diffusers = self.registries.diffusers().get(backend);
        let transformers = self.registries.transformers().map(|r| r.get(backend));
        let (diffusers, transformers) = match (diffusers, transformers) {
            (Some(d), None) => (d, None),
            (Some(d), Some(Some(t))) => (d, Some(t)),
            _ => {
                return Err(QuantError::UnknownBackend {
                    scope: Scope::default(),
                    backend: backend.to_string(),
                    available: self.registries.available_backends(),
                })
            }
        };
        if let Some(transformers) = transformers {
            let (d, t) = (diffusers.params(), transformers.params());
            if d != t {
                return Err(QuantError::SignatureMismatch {
                    backend: backend.to_string(),
                    diffusers_only: d.difference(t).cloned().collect(),
                    transformers_only: t.difference(d).cloned().collect(),
                });
            }
        }
        Ok(())
    }

    fn validate_mapping(&self, mapping: &BTreeMap<String, ModuleQuantSpec>) -> QuantResult<()> {
        for (module_name, spec) in mapping {
            if !self.registries.consulted().any(|r| r.contains(&spec.backend)) {
                return Err(QuantError::UnknownBackend {
                    scope: Scope::module(module_name),
                    backend: spec.backend.clone(),
                    available: self.registries.available_backends(),
                });
            }
            if let Some(ModuleFilter::Include(modules)) = &self.module_filter {
                if modules.contains(module_name) {
                    tracing::warn!(
                        module = %module_name,
                        "mapping entry takes precedence over `modules_to_quantize`"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn is_granular(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn backend_kwargs(&self) -> &toml::Table {
        &self.backend_kwargs
    }

    pub fn module_filter(&self) -> Option<&ModuleFilter> {
        self.module_filter.as_ref()
    }

    pub fn mapping(&self) -> Option<&BTreeMap<String, ModuleQuantSpec>> {
        self.mapping.as_ref()
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    /// Whether the default backend applies to a module without a mapping entry.
    pub fn should_quantize(&self, module_name: &str) -> bool {
        match &self.module_filter {
            Some(filter) => filter.admits(module_name),
            None => !self.is_granular(),
        }
    }

    /// Returns the config to load `module_name` with, or `None` to leave it
    /// unquantized.
    pub fn resolve(
        &self,
        module_name: &str,
        source: RegistrySource,
    ) -> QuantResult<Option<QuantConfig>> {
        let registry = self.registries.get(source).ok_or_else(|| {
            QuantError::UnavailableRegistry { module: module_name.to_string() }
        })?;

        if let Some(spec) = self.mapping.as_ref().and_then(|m| m.get(module_name)) {
            return Self::instantiate(registry, &spec.backend, &spec.backend_kwargs, module_name)
                .map(Some);
        }

        match &self.backend {
            Some(backend) if self.should_quantize(module_name) => {
                Self::instantiate(registry, backend, &self.backend_kwargs, module_name).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn instantiate(
        registry: &BackendRegistry,
        backend: &str,
        kwargs: &toml::Table,
        module_name: &str,
    ) -> QuantResult<QuantConfig> {
        let scope = Scope::module(module_name);
        match registry.get(backend) {
            Some(entry) => entry.instantiate(kwargs, scope),
            None => Err(QuantError::UnknownBackend {
                scope,
                backend: backend.to_string(),
                available: AvailableBackends(vec![(registry.source(), registry.names())]),
            }),
        }
    }

    /// Resolves several modules, keeping only the ones that get quantized.
    pub fn resolve_all<'a, I>(&self, modules: I) -> QuantResult<BTreeMap<String, QuantConfig>>
    where
        I: IntoIterator<Item = (&'a str, RegistrySource)>,
    {
        let mut resolved = BTreeMap::new();
        for (module_name, source) in modules {
            if let Some(config) = self.resolve(module_name, source)? {
                resolved.insert(module_name.to_string(), config);
            }
        }
        Ok(resolved)
    }

    /// Resolves every quantizable component of a pipeline against the
    /// registry of the library that owns it.
    pub fn resolve_components(
        &self,
        pipeline: &PipelineDescriptor,
    ) -> QuantResult<BTreeMap<String, QuantConfig>> {
        self.resolve_all(
            pipeline
                .components()
                .iter()
                .filter_map(|c| c.library.map(|library| (c.name, library))),
        )
    }
}

impl fmt::Display for PipelineQuantizationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.is_granular() { "granular" } else { "global" };
        writeln!(f, "PipelineQuantizationConfig ({mode})")?;
        if let Some(backend) = &self.backend {
            writeln!(f, "  backend: {backend}")?;
            for (name, value) in &self.backend_kwargs {
                writeln!(f, "    {name} = {value}")?;
            }
        }
        match &self.module_filter {
            Some(ModuleFilter::Include(modules)) => {
                writeln!(f, "  modules_to_quantize: {modules:?}")?
            }
            Some(ModuleFilter::Exclude(modules)) => writeln!(f, "  exclude_modules: {modules:?}")?,
            None => {}
        }
        for (module_name, spec) in self.mapping.iter().flatten() {
            writeln!(f, "  {module_name} -> {}", spec.backend)?;
            for (name, value) in &spec.backend_kwargs {
                writeln!(f, "    {name} = {value}")?;
            }
        }
        Ok(())
    }
}
