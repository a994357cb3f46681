//! # Marigold
//!
//! Dense prediction pipelines fine-tuned from Stable Diffusion: monocular
//! depth, surface normals and intrinsic image decomposition.
//!
//! https://huggingface.co/docs/diffusers/api/pipelines/marigold
use once_cell::sync::Lazy;

use super::{Component, Export, LazyModule, PipelineDescriptor, Requirement};
use crate::quantizers::RegistrySource;

const IMPORT_STRUCTURE: &[(&str, &[&str])] = &[
    ("marigold_image_processing", &["MarigoldImageProcessor"]),
    ("pipeline_marigold_depth", &["MarigoldDepthOutput", "MarigoldDepthPipeline"]),
    ("pipeline_marigold_intrinsics", &["MarigoldIntrinsicsOutput", "MarigoldIntrinsicsPipeline"]),
    ("pipeline_marigold_normals", &["MarigoldNormalsOutput", "MarigoldNormalsPipeline"]),
];

const COMPONENTS: &[Component] = &[
    Component::model("unet", RegistrySource::Diffusers),
    Component::model("vae", RegistrySource::Diffusers),
    Component::auxiliary("scheduler"),
    Component::model("text_encoder", RegistrySource::Transformers),
    Component::auxiliary("tokenizer"),
];

static MODULE: Lazy<LazyModule> = Lazy::new(|| {
    LazyModule::new(
        "pipelines.marigold",
        IMPORT_STRUCTURE,
        &[Requirement::Torch, Requirement::Transformers],
        load,
    )
});

/// The Marigold export table.
pub fn module() -> &'static LazyModule {
    &MODULE
}

fn load(submodule: &str) -> Vec<Export> {
    match submodule {
        "marigold_image_processing" => {
            vec![Export::ImageProcessor { name: "MarigoldImageProcessor" }]
        }
        "pipeline_marigold_depth" => MarigoldTask::Depth.exports(),
        "pipeline_marigold_intrinsics" => MarigoldTask::Intrinsics.exports(),
        "pipeline_marigold_normals" => MarigoldTask::Normals.exports(),
        _ => vec![],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarigoldTask {
    Depth,
    Normals,
    Intrinsics,
}

impl MarigoldTask {
    pub fn pipeline_name(&self) -> &'static str {
        match self {
            MarigoldTask::Depth => "MarigoldDepthPipeline",
            MarigoldTask::Normals => "MarigoldNormalsPipeline",
            MarigoldTask::Intrinsics => "MarigoldIntrinsicsPipeline",
        }
    }

    pub fn output_name(&self) -> &'static str {
        match self {
            MarigoldTask::Depth => "MarigoldDepthOutput",
            MarigoldTask::Normals => "MarigoldNormalsOutput",
            MarigoldTask::Intrinsics => "MarigoldIntrinsicsOutput",
        }
    }

    pub fn output_fields(&self) -> &'static [&'static str] {
        &["prediction", "uncertainty", "latent"]
    }

    /// Channels of each predicted map: depth is scalar, normals and the
    /// intrinsic targets (albedo, shading, ...) are RGB-like.
    pub fn prediction_channels(&self) -> usize {
        match self {
            MarigoldTask::Depth => 1,
            MarigoldTask::Normals | MarigoldTask::Intrinsics => 3,
        }
    }

    pub fn descriptor(&self) -> PipelineDescriptor {
        PipelineDescriptor { name: self.pipeline_name(), task: *self, components: COMPONENTS }
    }

    fn exports(&self) -> Vec<Export> {
        vec![
            Export::Output { name: self.output_name(), task: *self },
            Export::Pipeline(self.descriptor()),
        ]
    }
}
