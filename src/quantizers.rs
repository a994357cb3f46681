//! # Pipeline quantization configs.
//!
//! Maps the named modules of a diffusion pipeline to the quantization config
//! each one should be loaded with, against the config-class registries of
//! diffusers and (optionally) transformers.
pub mod configs;
pub mod error;
pub mod pipeline_config;
pub mod presets;
pub mod registry;

pub use configs::{
    BackendConfig, BitsAndBytesConfig, Bnb4BitQuantType, CustomQuantConfig, DType,
    GgufQuantizationConfig, QuantConfig, QuantoConfig, QuantoWeightsDtype, TorchAoConfig,
};
pub use error::{AvailableBackends, QuantError, QuantResult, Scope};
pub use pipeline_config::{
    ModuleFilter, ModuleQuantSpec, PipelineQuantizationConfig, PipelineQuantizationSpec,
};
pub use registry::{BackendEntry, BackendRegistry, ConfigConstructor, Registries, RegistrySource};
