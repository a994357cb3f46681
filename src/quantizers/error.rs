use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::registry::RegistrySource;

pub type QuantResult<T> = Result<T, QuantError>;

#[derive(Debug, Error)]
pub enum QuantError {
    #[error("Must provide a `backend` when not providing a `mapping`.")]
    MissingBackend,

    #[error("Both `backend_kwargs` and `mapping` cannot be empty.")]
    EmptyConfiguration,

    #[error(
        "In the granular case, a non-empty `mapping` defining the quantization configs \
         for the desired modules has to be provided."
    )]
    EmptyMapping,

    #[error("`modules_to_quantize` and `exclude_modules` cannot be supplied together.")]
    ConflictingModuleFilters,

    #[error("A module filter only applies to the default `backend`, but none was provided.")]
    FilterWithoutBackend,

    #[error("{scope}Provided backend `{backend}` was not found.{available}")]
    UnknownBackend {
        scope: Scope,
        backend: String,
        available: AvailableBackends,
    },

    #[error(
        "The declared parameters of the `{backend}` config classes differ between diffusers \
         and transformers (diffusers only: {diffusers_only:?}, transformers only: \
         {transformers_only:?}). Please consider using `mapping` instead."
    )]
    SignatureMismatch {
        backend: String,
        diffusers_only: Vec<String>,
        transformers_only: Vec<String>,
    },

    #[error("Transformers registry is not available; cannot resolve module `{module}` against it.")]
    UnavailableRegistry { module: String },

    #[error("{scope}Invalid arguments for backend `{backend}`: {source}")]
    InvalidBackendArguments {
        scope: Scope,
        backend: String,
        source: toml::de::Error,
    },

    #[error("error reading {path:?}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing quantization config {path:?}")]
    ParseConfig {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Optional module name prefixed to error messages raised for a single module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope(pub Option<String>);

impl Scope {
    pub fn module(name: &str) -> Self {
        Self(Some(name.to_string()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(module) => write!(f, "Module '{module}': "),
            None => Ok(()),
        }
    }
}

/// Backend names of every registry that was consulted, in consultation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailableBackends(pub Vec<(RegistrySource, Vec<String>)>);

impl AvailableBackends {
    pub fn names(&self, source: RegistrySource) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(s, _)| *s == source)
            .map(|(_, names)| names.as_slice())
    }
}

impl fmt::Display for AvailableBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (source, names) in &self.0 {
            write!(f, "\nAvailable ones ({source}): {names:?}.")?;
        }
        Ok(())
    }
}
