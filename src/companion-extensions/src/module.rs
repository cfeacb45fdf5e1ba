//! Loaded package code and the loaders that produce it.
//!
//! A [`ModuleLoader`] turns a package descriptor into an [`ExtensionModule`];
//! the module then resolves to one extension instance. Loaders are picked per
//! package by the descriptor's `runtime` field.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::context::ExtensionContext;
use crate::error::HookResult;
use crate::extension::Extension;
use crate::manifest::PackageDescriptor;
use crate::{ExtensionError, Result};

/// Constructor producing an extension instance for one load.
pub type Constructor =
    Box<dyn Fn(&ExtensionContext) -> HookResult<Box<dyn Extension>> + Send + Sync>;

/// How a module produced its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// A pre-built instance shipped with the module.
    Singleton,
    /// A factory function taking the context.
    Factory,
    /// A type constructed from the context.
    Type,
    /// The module exposes nothing; it acts as an extension with no hooks.
    Module,
}

impl std::fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Singleton => "singleton",
            Self::Factory => "factory",
            Self::Type => "type",
            Self::Module => "module",
        };
        f.write_str(name)
    }
}

/// A type the runtime can construct from a context.
pub trait ExtensionType: Extension + Sized + 'static {
    fn construct(context: &ExtensionContext) -> HookResult<Self>;
}

/// Extension with no hooks, used when a module exposes no instance.
struct BareModule;

impl Extension for BareModule {}

/// Code loaded for one package.
pub struct ExtensionModule {
    name: String,
    singleton: Option<Box<dyn Extension>>,
    factory: Option<Constructor>,
    type_ctor: Option<Constructor>,
}

impl std::fmt::Debug for ExtensionModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionModule")
            .field("name", &self.name)
            .field("singleton", &self.singleton.is_some())
            .field("factory", &self.factory.is_some())
            .field("type", &self.type_ctor.is_some())
            .finish()
    }
}

impl ExtensionModule {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            singleton: None,
            factory: None,
            type_ctor: None,
        }
    }

    /// Ship a pre-built instance.
    pub fn with_singleton(mut self, instance: impl Extension + 'static) -> Self {
        self.singleton = Some(Box::new(instance));
        self
    }

    /// Expose a factory taking the context.
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ExtensionContext) -> HookResult<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Expose a type constructed from the context.
    pub fn with_type<T: ExtensionType>(mut self) -> Self {
        self.type_ctor = Some(Box::new(|context: &ExtensionContext| {
            T::construct(context).map(|instance| Box::new(instance) as Box<dyn Extension>)
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the instance: singleton, then factory, then type, falling back
    /// to a bare module with no hooks.
    ///
    /// The singleton is handed out once; resolving again moves on to the next
    /// strategy.
    pub fn resolve(
        &mut self,
        context: &ExtensionContext,
    ) -> HookResult<(ResolutionKind, Box<dyn Extension>)> {
        if let Some(instance) = self.singleton.take() {
            return Ok((ResolutionKind::Singleton, instance));
        }
        if let Some(factory) = &self.factory {
            return Ok((ResolutionKind::Factory, factory(context)?));
        }
        if let Some(ctor) = &self.type_ctor {
            return Ok((ResolutionKind::Type, ctor(context)?));
        }
        let bare: Box<dyn Extension> = Box::new(BareModule);
        Ok((ResolutionKind::Module, bare))
    }
}

/// Loads package code for one runtime.
pub trait ModuleLoader: Send + Sync {
    /// Load the code behind `descriptor`.
    ///
    /// The entry file is known to exist when this is called.
    fn load(&self, descriptor: &PackageDescriptor) -> Result<ExtensionModule>;
}

/// Loaders keyed by runtime name.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn ModuleLoader>>,
}

impl LoaderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `process` loader.
    pub fn with_defaults(default_timeout_ms: u64) -> Self {
        let mut registry = Self::new();
        registry.register(
            crate::manifest::DEFAULT_RUNTIME,
            crate::process::ProcessLoader::new(default_timeout_ms),
        );
        registry
    }

    /// Register (or replace) the loader for `runtime`.
    pub fn register(&mut self, runtime: impl Into<String>, loader: impl ModuleLoader + 'static) {
        self.loaders.insert(runtime.into(), Arc::new(loader));
    }

    pub fn get(&self, runtime: &str) -> Option<Arc<dyn ModuleLoader>> {
        self.loaders.get(runtime).cloned()
    }

    /// Registered runtime names, sorted.
    pub fn runtimes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaders.keys().cloned().collect();
        names.sort();
        names
    }
}

type ModuleBuilder = Arc<dyn Fn() -> ExtensionModule + Send + Sync>;

/// Loader for extensions compiled into the host.
///
/// The package entry file holds the name of a registered module.
#[derive(Clone, Default)]
pub struct StaticModuleLoader {
    modules: HashMap<String, ModuleBuilder>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module builder under `name`.
    ///
    /// The builder runs on every load so each load gets fresh state.
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn() -> ExtensionModule + Send + Sync + 'static,
    {
        self.modules.insert(name.into(), Arc::new(builder));
    }

    /// Builder-style [`StaticModuleLoader::register`].
    pub fn with_module<F>(mut self, name: impl Into<String>, builder: F) -> Self
    where
        F: Fn() -> ExtensionModule + Send + Sync + 'static,
    {
        self.register(name, builder);
        self
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, descriptor: &PackageDescriptor) -> Result<ExtensionModule> {
        let entry = descriptor.entry_path();
        let content = std::fs::read_to_string(&entry).map_err(|e| {
            ExtensionError::load_error(
                &descriptor.id,
                format!("cannot read {}: {e}", entry.display()),
            )
        })?;
        let name = content.trim();
        let builder = self.modules.get(name).ok_or_else(|| {
            ExtensionError::load_error(&descriptor.id, format!("unknown module '{name}'"))
        })?;
        Ok(builder())
    }
}
