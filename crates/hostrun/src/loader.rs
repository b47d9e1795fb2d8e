//! # Component Loader
//!
//! Locates the module that implements a component type and instantiates the
//! component inside an isolated context.
//!
//! A module is a manifest file on disk (`<module>.toml`, falling back to
//! `<module>.json` by default) listing the component types it exports. The
//! code behind each exported type is a constructor registered in the
//! [`ModuleCatalog`]. Constructors take the component name as their only
//! argument and run on the context thread.

use std::any::Any;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::context::ContextSetup;
use crate::context::IsolationContext;
use crate::remote::CallError;
use crate::remote::Remote;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot find module file for {type_name} from module {module} (searched {searched:?})")]
    ModuleNotFound {
        module: String,
        type_name: String,
        searched: Vec<PathBuf>,
    },
    #[error("Invalid manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },
    #[error("Failed to write manifest {path}: {reason}")]
    ManifestWrite { path: PathBuf, reason: String },
    #[error("Failed to shadow copy {path} into {target}: {source}")]
    ShadowCopy {
        path: PathBuf,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Module {module} does not provide component type {type_name}")]
    TypeNotFound { module: String, type_name: String },
    #[error(
        "Cannot cast component object {actual} from module {module_path} to type {expected} ({type_name} in module {module})"
    )]
    TypeMismatch {
        module: String,
        type_name: String,
        module_path: PathBuf,
        actual: String,
        expected: String,
    },
    #[error("Could not create component {type_name} from module {module} in context '{context}': {reason}")]
    InstantiationFailed {
        module: String,
        type_name: String,
        context: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Identity of a component type: the module implementing it and the type's
/// name within that module.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComponentDescriptor {
    pub module: String,
    pub type_name: String,
}

impl ComponentDescriptor {
    pub fn new(module: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            type_name: type_name.into(),
        }
    }

    pub fn of<T: HostedComponent>() -> Self {
        Self::new(T::MODULE, T::TYPE_NAME)
    }
}

impl std::fmt::Display for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module, self.type_name)
    }
}

/// A type that can be hosted in an isolated context.
pub trait HostedComponent: 'static {
    /// Name of the module (manifest file stem) implementing the type.
    const MODULE: &'static str;
    /// Name the module exports the type under.
    const TYPE_NAME: &'static str;
}

/// Object produced by a constructor, before it is checked against the
/// expected component type.
pub trait Instance: Any {
    fn type_name(&self) -> &'static str;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> Instance for T {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Builds a component from its name. `None` means construction produced no
/// object.
pub type Constructor = Arc<dyn Fn(&str) -> Option<Box<dyn Instance>> + Send + Sync>;

/// Registry of component constructors, keyed by descriptor.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    constructors: Arc<DashMap<ComponentDescriptor, Constructor>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw constructor under `descriptor`, replacing any previous one.
    pub fn register(&self, descriptor: ComponentDescriptor, ctor: Constructor) {
        self.constructors.insert(descriptor, ctor);
    }

    /// Registers the constructor for a hosted component type.
    pub fn register_type<T, F>(&self, ctor: F)
    where
        T: HostedComponent,
        F: Fn(&str) -> T + Send + Sync + 'static,
    {
        self.register(
            ComponentDescriptor::of::<T>(),
            Arc::new(move |name: &str| Some(Box::new(ctor(name)) as Box<dyn Instance>)),
        );
    }

    pub fn get(&self, descriptor: &ComponentDescriptor) -> Option<Constructor> {
        self.constructors
            .get(descriptor)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, descriptor: &ComponentDescriptor) -> bool {
        self.constructors.contains_key(descriptor)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl std::fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.constructors.iter().map(|e| e.key().to_string()).collect();
        keys.sort();
        f.debug_struct("ModuleCatalog").field("types", &keys).finish()
    }
}

/// On-disk description of a module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
}

impl ModuleManifest {
    pub fn new(name: impl Into<String>, version: Option<String>, components: Vec<String>) -> Self {
        Self {
            name: name.into(),
            version,
            components,
        }
    }

    /// Serializes the manifest to `path`, as JSON for `.json` files and TOML
    /// otherwise.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let failed = |reason: String| Error::ManifestWrite {
            path: path.to_path_buf(),
            reason,
        };

        let text = if is_json(path) {
            serde_json::to_string_pretty(self).map_err(|e| failed(e.to_string()))?
        } else {
            toml::to_string(self).map_err(|e| failed(e.to_string()))?
        };
        std::fs::write(path, text).map_err(|e| failed(e.to_string()))
    }

    pub fn exports(&self, type_name: &str) -> bool {
        self.components.iter().any(|c| c == type_name)
    }
}

/// A module located (and possibly shadow copied) for one load.
#[derive(Clone, Debug)]
pub struct ResolvedModule {
    pub descriptor: ComponentDescriptor,
    /// The module file found in the application base.
    pub path: PathBuf,
    /// The file the manifest was actually read from.
    pub loaded_from: PathBuf,
    pub manifest: ModuleManifest,
}

/// Outcome of running a constructor inside the context.
enum Built {
    Stored(crate::remote::ObjectId),
    Empty,
    Mismatch { actual: &'static str },
}

/// Resolves modules and instantiates components.
#[derive(Clone, Debug)]
pub struct ComponentLoader {
    catalog: ModuleCatalog,
    primary_extension: String,
    fallback_extension: String,
}

impl ComponentLoader {
    pub fn new(
        catalog: ModuleCatalog,
        primary_extension: impl Into<String>,
        fallback_extension: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            primary_extension: primary_extension.into(),
            fallback_extension: fallback_extension.into(),
        }
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// Finds the module file, trying the primary extension first.
    pub fn locate(&self, descriptor: &ComponentDescriptor, base: &Path) -> Result<PathBuf> {
        let mut searched = Vec::with_capacity(2);
        for extension in [&self.primary_extension, &self.fallback_extension] {
            let candidate = base.join(format!("{}.{}", descriptor.module, extension));
            if candidate.is_file() {
                return Ok(candidate);
            }
            searched.push(candidate);
        }
        Err(Error::ModuleNotFound {
            module: descriptor.module.clone(),
            type_name: descriptor.type_name.clone(),
            searched,
        })
    }

    /// Locates, shadow copies (if the setup asks for it) and parses the module
    /// for `descriptor`, checking that it exports the type.
    pub fn resolve(
        &self,
        descriptor: &ComponentDescriptor,
        setup: &ContextSetup,
        context_name: &str,
    ) -> Result<ResolvedModule> {
        let path = self.locate(descriptor, &setup.application_base)?;

        let loaded_from = match (&setup.cache_path, path.parent()) {
            (Some(cache), Some(dir)) if setup.shadow_copies(dir) => {
                shadow_copy(&path, &cache.join(context_name))?
            }
            _ => path.clone(),
        };

        let manifest = read_manifest(&loaded_from)?;
        if !manifest.exports(&descriptor.type_name) {
            return Err(Error::TypeNotFound {
                module: descriptor.module.clone(),
                type_name: descriptor.type_name.clone(),
            });
        }

        tracing::debug!(
            module = %descriptor.module,
            path = %loaded_from.display(),
            "Resolved component module"
        );

        Ok(ResolvedModule {
            descriptor: descriptor.clone(),
            path,
            loaded_from,
            manifest,
        })
    }

    /// Builds the component inside `context` and returns a typed stub.
    pub fn instantiate<T: HostedComponent>(
        &self,
        context: &IsolationContext,
        module: &ResolvedModule,
        name: &str,
    ) -> Result<Remote<T>> {
        let descriptor = &module.descriptor;
        let ctor = self.catalog.get(descriptor).ok_or_else(|| Error::TypeNotFound {
            module: descriptor.module.clone(),
            type_name: descriptor.type_name.clone(),
        })?;

        let component_name = name.to_string();
        let built = context
            .invoke(move |state| match ctor(&component_name) {
                None => Built::Empty,
                Some(instance) => {
                    let actual = (*instance).type_name();
                    let object = instance.into_any();
                    if object.is::<T>() {
                        Built::Stored(state.insert(object))
                    } else {
                        Built::Mismatch { actual }
                    }
                }
            })
            .map_err(|e| self.instantiation_failed(descriptor, context, e))?;

        match built {
            Built::Stored(object) => Ok(Remote::new(context.clone(), object)),
            Built::Empty => Err(Error::InstantiationFailed {
                module: descriptor.module.clone(),
                type_name: descriptor.type_name.clone(),
                context: context.name().to_string(),
                reason: "constructor returned no object".into(),
            }),
            Built::Mismatch { actual } => {
                let expected = std::any::type_name::<T>();
                tracing::warn!(
                    actual_type = actual,
                    actual_module = module_of(actual),
                    expected_type = expected,
                    expected_module = module_of(expected),
                    module_path = %module.loaded_from.display(),
                    "Component type mismatch"
                );
                Err(Error::TypeMismatch {
                    module: descriptor.module.clone(),
                    type_name: descriptor.type_name.clone(),
                    module_path: module.loaded_from.clone(),
                    actual: actual.to_string(),
                    expected: expected.to_string(),
                })
            }
        }
    }

    fn instantiation_failed(
        &self,
        descriptor: &ComponentDescriptor,
        context: &IsolationContext,
        cause: CallError,
    ) -> Error {
        Error::InstantiationFailed {
            module: descriptor.module.clone(),
            type_name: descriptor.type_name.clone(),
            context: context.name().to_string(),
            reason: cause.to_string(),
        }
    }
}

/// Parses a manifest, as JSON for `.json` files and TOML otherwise.
pub fn read_manifest(path: &Path) -> Result<ModuleManifest> {
    let invalid = |reason: String| Error::ManifestInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    if is_json(path) {
        serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))
    } else {
        toml::from_str(&text).map_err(|e| invalid(e.to_string()))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn shadow_copy(path: &Path, target_dir: &Path) -> Result<PathBuf> {
    let file_name = path.file_name().unwrap_or(path.as_os_str());
    let target = target_dir.join(file_name);
    let copy_failed = |source| Error::ShadowCopy {
        path: path.to_path_buf(),
        target: target.clone(),
        source,
    };

    std::fs::create_dir_all(target_dir).map_err(copy_failed)?;
    std::fs::copy(path, &target).map_err(copy_failed)?;
    Ok(target)
}

/// Module path of a fully qualified Rust type name.
fn module_of(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    match base.rfind("::") {
        Some(idx) => &base[..idx],
        None => "",
    }
}
