//! # Pipeline exports.
//!
//! Descriptors for the image-to-image pipelines this crate knows how to
//! quantize, published through lazily populated export tables.
pub mod lazy;
pub mod marigold;

pub use lazy::{Attr, DummyObject, LazyModule, Loader, PipelineError, PipelineResult, Requirement};
pub use marigold::MarigoldTask;

use crate::quantizers::RegistrySource;

/// A named sub-model of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    pub name: &'static str,
    /// Library whose registry quantizes this component, `None` for
    /// components that hold no weights (schedulers, tokenizers).
    pub library: Option<RegistrySource>,
}

impl Component {
    pub const fn model(name: &'static str, library: RegistrySource) -> Self {
        Self { name, library: Some(library) }
    }

    pub const fn auxiliary(name: &'static str) -> Self {
        Self { name, library: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescriptor {
    pub name: &'static str,
    pub task: MarigoldTask,
    pub components: &'static [Component],
}

impl PipelineDescriptor {
    pub fn components(&self) -> &[Component] {
        self.components
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// An object published by a [`LazyModule`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Export {
    Pipeline(PipelineDescriptor),
    Output { name: &'static str, task: MarigoldTask },
    ImageProcessor { name: &'static str },
}

impl Export {
    pub fn name(&self) -> &'static str {
        match self {
            Export::Pipeline(p) => p.name,
            Export::Output { name, .. } | Export::ImageProcessor { name } => name,
        }
    }

    pub fn as_pipeline(&self) -> Option<&PipelineDescriptor> {
        match self {
            Export::Pipeline(p) => Some(p),
            _ => None,
        }
    }
}
