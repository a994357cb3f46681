pub mod pipelines;
pub mod quantizers;
pub mod utils;

pub use pipelines::marigold;
pub use quantizers::{
    PipelineQuantizationConfig, PipelineQuantizationSpec, QuantConfig, QuantError, RegistrySource,
};
