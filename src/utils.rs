use std::path::Path;

use crate::quantizers::{QuantError, QuantResult};

/// Whether the crate was built with torch-backed pipelines enabled.
pub fn is_torch_available() -> bool {
    cfg!(feature = "torch")
}

/// Whether the transformers backend registry (and transformers-owned
/// components such as text encoders) is compiled in.
pub fn is_transformers_available() -> bool {
    cfg!(feature = "transformers")
}

pub(crate) fn read_config_file<P: AsRef<Path>>(path: P) -> QuantResult<String> {
    std::fs::read_to_string(path.as_ref()).map_err(|source| QuantError::ReadConfig {
        path: path.as_ref().to_path_buf(),
        source,
    })
}
