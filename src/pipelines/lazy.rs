use std::fmt;

use once_cell::sync::OnceCell;
use thiserror::Error;

use super::Export;
use crate::utils;

/// Optional dependency an export table can be gated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Requirement {
    Torch,
    Transformers,
}

impl Requirement {
    pub fn is_available(self) -> bool {
        match self {
            Requirement::Torch => utils::is_torch_available(),
            Requirement::Transformers => utils::is_transformers_available(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Torch => write!(f, "torch"),
            Requirement::Transformers => write!(f, "transformers"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("module `{module}` has no attribute `{name}`")]
    UnknownExport { module: String, name: String },
    #[error(
        "{name} requires the {} backends but they were not found in your environment",
        join(.missing)
    )]
    MissingDependencies { name: String, missing: Vec<Requirement> },
}

fn join(requirements: &[Requirement]) -> String {
    requirements.iter().map(Requirement::to_string).collect::<Vec<_>>().join(", ")
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Builds the exports of one submodule.
pub type Loader = fn(&str) -> Vec<Export>;

/// Stand-in published when requirements are missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyObject {
    pub name: &'static str,
    pub missing: Vec<Requirement>,
}

impl DummyObject {
    pub fn error(&self) -> PipelineError {
        PipelineError::MissingDependencies {
            name: self.name.to_string(),
            missing: self.missing.clone(),
        }
    }
}

#[derive(Debug)]
pub enum Attr<'a> {
    Export(&'a Export),
    Dummy(DummyObject),
}

impl<'a> Attr<'a> {
    pub fn load(self) -> PipelineResult<&'a Export> {
        match self {
            Attr::Export(export) => Ok(export),
            Attr::Dummy(dummy) => Err(dummy.error()),
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Attr::Dummy(_))
    }
}

#[derive(Debug)]
struct Submodule {
    name: &'static str,
    exports: &'static [&'static str],
    loaded: OnceCell<Vec<Export>>,
}

/// A package whose exports are built on first access, one submodule at a time.
#[derive(Debug)]
pub struct LazyModule {
    name: &'static str,
    submodules: Vec<Submodule>,
    missing: Vec<Requirement>,
    loader: Loader,
}

impl LazyModule {
    pub fn new(
        name: &'static str,
        import_structure: &[(&'static str, &'static [&'static str])],
        requirements: &[Requirement],
        loader: Loader,
    ) -> Self {
        Self::with_probe(name, import_structure, requirements, loader, |r| r.is_available())
    }

    pub fn with_probe<F: Fn(Requirement) -> bool>(
        name: &'static str,
        import_structure: &[(&'static str, &'static [&'static str])],
        requirements: &[Requirement],
        loader: Loader,
        probe: F,
    ) -> Self {
        let missing: Vec<_> = requirements.iter().copied().filter(|r| !probe(*r)).collect();
        if !missing.is_empty() {
            tracing::debug!(module = name, ?missing, "publishing dummy objects");
        }
        let submodules = import_structure
            .iter()
            .map(|&(name, exports)| Submodule { name, exports, loaded: OnceCell::new() })
            .collect();
        Self { name, submodules, missing, loader }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_available(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn missing_requirements(&self) -> &[Requirement] {
        &self.missing
    }

    pub fn exports(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.submodules.iter().flat_map(|s| s.exports.iter().copied())
    }

    pub fn submodule_of(&self, name: &str) -> Option<&'static str> {
        self.find(name).map(|(submodule, _)| submodule.name)
    }

    pub fn is_loaded(&self, submodule: &str) -> bool {
        self.submodules.iter().any(|s| s.name == submodule && s.loaded.get().is_some())
    }

    fn find(&self, name: &str) -> Option<(&Submodule, &'static str)> {
        self.submodules.iter().find_map(|s| {
            let export = s.exports.iter().copied().find(|e| *e == name)?;
            Some((s, export))
        })
    }

    /// Looks up an export, loading its submodule if needed. Known names
    /// resolve to a [`DummyObject`] when requirements are missing.
    pub fn attr(&self, name: &str) -> PipelineResult<Attr<'_>> {
        let (submodule, export_name) =
            self.find(name).ok_or_else(|| PipelineError::UnknownExport {
                module: self.name.to_string(),
                name: name.to_string(),
            })?;
        if !self.is_available() {
            return Ok(Attr::Dummy(DummyObject {
                name: export_name,
                missing: self.missing.clone(),
            }));
        }
        let exports = submodule.loaded.get_or_init(|| {
            tracing::debug!(module = self.name, submodule = submodule.name, "loading submodule");
            (self.loader)(submodule.name)
        });
        exports
            .iter()
            .find(|e| e.name() == name)
            .map(Attr::Export)
            .ok_or_else(|| PipelineError::UnknownExport {
                module: format!("{}.{}", self.name, submodule.name),
                name: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> PipelineResult<&Export> {
        self.attr(name)?.load()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const STRUCTURE: &[(&str, &[&str])] = &[
        ("image_processing", &["ToyImageProcessor"]),
        ("pipeline_toy", &["ToyOutput", "ToyProcessor"]),
    ];

    fn loader(submodule: &str) -> Vec<Export> {
        match submodule {
            "image_processing" => vec![Export::ImageProcessor { name: "ToyImageProcessor" }],
            // "ToyProcessor" is declared but never built
            "pipeline_toy" => vec![Export::Output {
                name: "ToyOutput",
                task: crate::pipelines::MarigoldTask::Depth,
            }],
            _ => vec![],
        }
    }

    #[test]
    fn test_exports_and_lookup() {
        let module =
            LazyModule::with_probe("toy", STRUCTURE, &[Requirement::Torch], loader, |_| true);
        assert!(module.is_available());
        assert_eq!(
            module.exports().collect::<Vec<_>>(),
            ["ToyImageProcessor", "ToyOutput", "ToyProcessor"]
        );
        assert_eq!(module.submodule_of("ToyOutput"), Some("pipeline_toy"));
        assert_eq!(module.submodule_of("Nope"), None);
    }

    static PROCESSOR_LOADS: AtomicUsize = AtomicUsize::new(0);

    fn counting_loader(submodule: &str) -> Vec<Export> {
        PROCESSOR_LOADS.fetch_add(1, Ordering::SeqCst);
        loader(submodule)
    }

    #[test]
    fn test_submodule_loaded_once() {
        let module = LazyModule::with_probe("toy", STRUCTURE, &[], counting_loader, |_| true);
        assert!(!module.is_loaded("image_processing"));
        let export = module.get("ToyImageProcessor").unwrap();
        assert_eq!(export.name(), "ToyImageProcessor");
        module.get("ToyImageProcessor").unwrap();
        assert!(module.is_loaded("image_processing"));
        assert!(!module.is_loaded("pipeline_toy"));
        assert_eq!(PROCESSOR_LOADS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_export() {
        let module = LazyModule::with_probe("toy", STRUCTURE, &[], loader, |_| true);
        let err = module.get("Nope").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnknownExport { ref module, ref name }
                if module == "toy" && name == "Nope"
        ));
        // declared but not produced by the loader
        let err = module.get("ToyProcessor").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnknownExport { ref module, .. } if module == "toy.pipeline_toy"
        ));
    }

    #[test]
    fn test_dummy_objects_when_requirements_missing() {
        let module = LazyModule::with_probe(
            "toy",
            STRUCTURE,
            &[Requirement::Torch, Requirement::Transformers],
            loader,
            |r| r == Requirement::Torch,
        );
        assert!(!module.is_available());
        assert_eq!(module.missing_requirements(), [Requirement::Transformers]);
        let attr = module.attr("ToyOutput").unwrap();
        assert!(attr.is_dummy());
        let err = attr.load().unwrap_err();
        assert_eq!(
            err.to_string(),
            "ToyOutput requires the transformers backends but they were not found in your environment"
        );
        assert!(!module.is_loaded("pipeline_toy"));
    }

    #[test]
    fn test_dummy_names_every_missing_requirement() {
        let module = LazyModule::with_probe(
            "toy",
            STRUCTURE,
            &[Requirement::Torch, Requirement::Transformers],
            loader,
            |_| false,
        );
        match module.attr("ToyImageProcessor").unwrap() {
            Attr::Dummy(dummy) => {
                assert_eq!(dummy.name, "ToyImageProcessor");
                assert!(dummy.error().to_string().starts_with(
                    "ToyImageProcessor requires the torch, transformers backends"
                ));
            }
            Attr::Export(export) => panic!("unexpected export {export:?}"),
        }
        assert!(!module.is_loaded("pipeline_toy"));
        assert!(matches!(module.get("Nope"), Err(PipelineError::UnknownExport { .. })));
    }
}
