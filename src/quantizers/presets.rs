use super::{ModuleQuantSpec, PipelineQuantizationSpec};

fn kwargs(pairs: &[(&str, toml::Value)]) -> toml::Table {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// 4-bit NF4 on the denoiser only.
/// https://huggingface.co/docs/diffusers/quantization/bitsandbytes
pub fn bnb_4bit_nf4() -> PipelineQuantizationSpec {
    PipelineQuantizationSpec::default()
        .with_backend("bitsandbytes_4bit")
        .with_kwarg("load_in_4bit", true)
        .with_kwarg("bnb_4bit_quant_type", "nf4")
        .with_kwarg("bnb_4bit_compute_dtype", "bfloat16")
        .with_modules_to_quantize(&["unet", "transformer"])
}

/// LLM.int8() for every component.
pub fn bnb_8bit() -> PipelineQuantizationSpec {
    PipelineQuantizationSpec::default()
        .with_backend("bitsandbytes_8bit")
        .with_kwarg("load_in_8bit", true)
}

pub fn quanto_int8() -> PipelineQuantizationSpec {
    PipelineQuantizationSpec::default()
        .with_backend("quanto")
        .with_kwarg("weights_dtype", "int8")
}

/// Marigold on small GPUs: NF4 unet, 8-bit text encoder, full precision VAE.
pub fn marigold_low_memory() -> PipelineQuantizationSpec {
    PipelineQuantizationSpec::default()
        .with_module(
            "unet",
            ModuleQuantSpec::new(
                "bitsandbytes_4bit",
                kwargs(&[
                    ("load_in_4bit", true.into()),
                    ("bnb_4bit_quant_type", "nf4".into()),
                    ("bnb_4bit_use_double_quant", true.into()),
                ]),
            ),
        )
        .with_module(
            "text_encoder",
            ModuleQuantSpec::new("bitsandbytes_8bit", kwargs(&[("load_in_8bit", true.into())])),
        )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::quantizers::{
        BackendRegistry, PipelineQuantizationConfig, QuantConfig, Registries, RegistrySource,
    };

    fn registries() -> Arc<Registries> {
        let transformers = Some(BackendRegistry::transformers());
        Arc::new(Registries::new(BackendRegistry::diffusers(), transformers))
    }

    #[test]
    fn test_presets_validate() {
        for spec in [bnb_4bit_nf4(), bnb_8bit(), quanto_int8(), marigold_low_memory()] {
            PipelineQuantizationConfig::new(spec.clone(), registries())
                .unwrap_or_else(|e| panic!("{spec:?}: {e}"));
        }
    }

    #[test]
    fn test_marigold_low_memory() {
        let plan = PipelineQuantizationConfig::new(marigold_low_memory(), registries()).unwrap();
        match plan.resolve("unet", RegistrySource::Diffusers).unwrap() {
            Some(QuantConfig::BitsAndBytes(c)) => {
                assert_eq!(c.bits(), Some(4));
                assert!(c.bnb_4bit_use_double_quant);
            }
            other => panic!("unexpected config {other:?}"),
        }
        assert!(plan.resolve("vae", RegistrySource::Diffusers).unwrap().is_none());
    }
}
