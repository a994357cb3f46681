//! Configuration classes instantiated by the backend registries.
//!
//! Every class is deserialized from the `backend_kwargs` table of a plan, so
//! the keyword arguments a user writes in TOML map one-to-one onto fields.
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[serde(alias = "fp32")]
    Float32,
    #[serde(alias = "fp16")]
    Float16,
    #[serde(alias = "bf16")]
    BFloat16,
}

/// A configuration class that a registry entry can construct.
pub trait BackendConfig: DeserializeOwned + Into<QuantConfig> {
    const CLASS_NAME: &'static str;
    /// Keyword arguments accepted by the constructor.
    const PARAMS: &'static [&'static str];

    /// Checks run after the fields are populated.
    fn post_init(&self) -> Result<(), String> {
        Ok(())
    }
}

/// The configuration instance handed to a model loader for one module.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "quant_method", content = "quant_args", rename_all = "lowercase")]
pub enum QuantConfig {
    BitsAndBytes(BitsAndBytesConfig),
    Gguf(GgufQuantizationConfig),
    Quanto(QuantoConfig),
    TorchAo(TorchAoConfig),
    Custom(CustomQuantConfig),
}

impl QuantConfig {
    pub fn class_name(&self) -> &str {
        match self {
            QuantConfig::BitsAndBytes(_) => BitsAndBytesConfig::CLASS_NAME,
            QuantConfig::Gguf(_) => GgufQuantizationConfig::CLASS_NAME,
            QuantConfig::Quanto(_) => QuantoConfig::CLASS_NAME,
            QuantConfig::TorchAo(_) => TorchAoConfig::CLASS_NAME,
            QuantConfig::Custom(c) => &c.backend,
        }
    }

    pub fn modules_to_not_convert(&self) -> &[String] {
        let modules = match self {
            QuantConfig::BitsAndBytes(c) => c.llm_int8_skip_modules.as_deref(),
            QuantConfig::Quanto(c) => c.modules_to_not_convert.as_deref(),
            QuantConfig::TorchAo(c) => c.modules_to_not_convert.as_deref(),
            QuantConfig::Gguf(_) | QuantConfig::Custom(_) => None,
        };
        modules.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bnb4BitQuantType {
    #[default]
    Fp4,
    Nf4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BitsAndBytesConfig {
    pub load_in_8bit: bool,
    pub load_in_4bit: bool,
    pub llm_int8_threshold: f64,
    pub llm_int8_skip_modules: Option<Vec<String>>,
    pub llm_int8_enable_fp32_cpu_offload: bool,
    pub llm_int8_has_fp16_weight: bool,
    pub bnb_4bit_compute_dtype: Option<DType>,
    pub bnb_4bit_quant_type: Bnb4BitQuantType,
    pub bnb_4bit_use_double_quant: bool,
    pub bnb_4bit_quant_storage: Option<DType>,
}

impl Default for BitsAndBytesConfig {
    fn default() -> Self {
        Self {
            load_in_8bit: false,
            load_in_4bit: false,
            llm_int8_threshold: 6.0,
            llm_int8_skip_modules: None,
            llm_int8_enable_fp32_cpu_offload: false,
            llm_int8_has_fp16_weight: false,
            bnb_4bit_compute_dtype: None,
            bnb_4bit_quant_type: Bnb4BitQuantType::Fp4,
            bnb_4bit_use_double_quant: false,
            bnb_4bit_quant_storage: None,
        }
    }
}

impl BitsAndBytesConfig {
    /// Weight bit width, `None` when neither loading flag is set.
    pub fn bits(&self) -> Option<u8> {
        if self.load_in_4bit {
            Some(4)
        } else if self.load_in_8bit {
            Some(8)
        } else {
            None
        }
    }
}

impl BackendConfig for BitsAndBytesConfig {
    const CLASS_NAME: &'static str = "BitsAndBytesConfig";
    const PARAMS: &'static [&'static str] = &[
        "load_in_8bit",
        "load_in_4bit",
        "llm_int8_threshold",
        "llm_int8_skip_modules",
        "llm_int8_enable_fp32_cpu_offload",
        "llm_int8_has_fp16_weight",
        "bnb_4bit_compute_dtype",
        "bnb_4bit_quant_type",
        "bnb_4bit_use_double_quant",
        "bnb_4bit_quant_storage",
    ];

    fn post_init(&self) -> Result<(), String> {
        if self.load_in_4bit && self.load_in_8bit {
            return Err("load_in_4bit and load_in_8bit are both True, but only one can be used at \
                 the same time"
                .to_string());
        }
        if self.llm_int8_threshold < 0. {
            return Err(format!(
                "llm_int8_threshold must be non-negative, got {}",
                self.llm_int8_threshold
            ));
        }
        Ok(())
    }
}

impl From<BitsAndBytesConfig> for QuantConfig {
    fn from(c: BitsAndBytesConfig) -> Self {
        QuantConfig::BitsAndBytes(c)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GgufQuantizationConfig {
    pub compute_dtype: Option<DType>,
}

impl GgufQuantizationConfig {
    pub fn effective_compute_dtype(&self) -> DType {
        self.compute_dtype.unwrap_or(DType::Float32)
    }
}

impl BackendConfig for GgufQuantizationConfig {
    const CLASS_NAME: &'static str = "GGUFQuantizationConfig";
    const PARAMS: &'static [&'static str] = &["compute_dtype"];
}

impl From<GgufQuantizationConfig> for QuantConfig {
    fn from(c: GgufQuantizationConfig) -> Self {
        QuantConfig::Gguf(c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantoWeightsDtype {
    Float8,
    #[default]
    Int8,
    Int4,
    Int2,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuantoConfig {
    pub weights_dtype: QuantoWeightsDtype,
    pub modules_to_not_convert: Option<Vec<String>>,
}

impl BackendConfig for QuantoConfig {
    const CLASS_NAME: &'static str = "QuantoConfig";
    const PARAMS: &'static [&'static str] = &["weights_dtype", "modules_to_not_convert"];
}

impl From<QuantoConfig> for QuantConfig {
    fn from(c: QuantoConfig) -> Self {
        QuantConfig::Quanto(c)
    }
}

const TORCHAO_QUANT_TYPES: &[&str] = &[
    "int4wo",
    "int4_weight_only",
    "int4dq",
    "int8wo",
    "int8_weight_only",
    "int8dq",
    "int8_dynamic_activation_int8_weight",
    "float8wo",
    "float8wo_e5m2",
    "float8wo_e4m3",
    "float8_weight_only",
    "float8dq",
    "float8dq_e4m3",
    "float8_dynamic_activation_float8_weight",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TorchAoConfig {
    pub quant_type: String,
    #[serde(default)]
    pub modules_to_not_convert: Option<Vec<String>>,
    // Only declared by the transformers registry.
    #[serde(default)]
    pub include_input_output_embeddings: Option<bool>,
    #[serde(default)]
    pub untie_embedding_weights: Option<bool>,
}

impl BackendConfig for TorchAoConfig {
    const CLASS_NAME: &'static str = "TorchAoConfig";
    const PARAMS: &'static [&'static str] = &["quant_type", "modules_to_not_convert"];

    fn post_init(&self) -> Result<(), String> {
        if TORCHAO_QUANT_TYPES.contains(&self.quant_type.as_str()) {
            Ok(())
        } else {
            Err(format!(
                "Requested quantization type: {} is not supported. Supported types: {:?}",
                self.quant_type, TORCHAO_QUANT_TYPES
            ))
        }
    }
}

impl From<TorchAoConfig> for QuantConfig {
    fn from(c: TorchAoConfig) -> Self {
        QuantConfig::TorchAo(c)
    }
}

/// Instance of a backend registered at runtime with only a parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomQuantConfig {
    pub backend: String,
    pub params: toml::Table,
}

impl CustomQuantConfig {
    pub fn get(&self, name: &str) -> Option<&toml::Value> {
        self.params.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<T: DeserializeOwned>(src: &str) -> T {
        let kwargs: toml::Table = toml::from_str(src).unwrap();
        toml::Value::Table(kwargs).try_into().unwrap()
    }

    #[test]
    fn test_bnb_defaults_and_bits() {
        let cfg: BitsAndBytesConfig = parse("load_in_4bit = true\nbnb_4bit_quant_type = \"nf4\"");
        assert_eq!(cfg.bits(), Some(4));
        assert_eq!(cfg.bnb_4bit_quant_type, Bnb4BitQuantType::Nf4);
        assert_eq!(cfg.llm_int8_threshold, 6.0);
        assert!(cfg.post_init().is_ok());
    }

    #[test]
    fn test_bnb_rejects_both_bit_widths() {
        let cfg =
            BitsAndBytesConfig { load_in_4bit: true, load_in_8bit: true, ..Default::default() };
        assert!(cfg.post_init().unwrap_err().contains("only one"));
    }

    #[test]
    fn test_dtype_aliases() {
        let cfg: GgufQuantizationConfig = parse("compute_dtype = \"bf16\"");
        assert_eq!(cfg.effective_compute_dtype(), DType::BFloat16);
        assert_eq!(GgufQuantizationConfig::default().effective_compute_dtype(), DType::Float32);
    }

    #[test]
    fn test_torchao_quant_type() {
        let cfg: TorchAoConfig = parse("quant_type = \"int8wo\"");
        assert!(cfg.post_init().is_ok());
        let cfg = TorchAoConfig { quant_type: "int9".to_string(), ..cfg };
        assert!(cfg.post_init().is_err());
    }

    #[test]
    fn test_modules_to_not_convert() {
        let cfg = QuantConfig::Quanto(QuantoConfig {
            weights_dtype: QuantoWeightsDtype::Float8,
            modules_to_not_convert: Some(vec!["proj_out".to_string()]),
        });
        assert_eq!(cfg.class_name(), "QuantoConfig");
        assert_eq!(cfg.modules_to_not_convert(), ["proj_out".to_string()]);
        assert!(QuantConfig::Gguf(Default::default()).modules_to_not_convert().is_empty());
    }
}
