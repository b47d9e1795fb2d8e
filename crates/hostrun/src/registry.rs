//! # Host Registry
//!
//! Name → context table of every component the host has loaded.
//!
//! A name is first reserved with a `Loading` placeholder through the map's
//! entry API, so concurrent creators of one name see exactly one winner, and
//! only becomes `Live` once the component is loaded. Teardown removes entries
//! unconditionally before destroying the context, and tolerates contexts
//! that are already gone.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::context;
use crate::context::IsolationContext;
use crate::factory::IsolationContextFactory;
use crate::fault::UnhandledFailureReporter;
use crate::loader;
use crate::loader::ComponentDescriptor;
use crate::loader::ComponentLoader;
use crate::loader::HostedComponent;
use crate::remote::Remote;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument '{argument}' to {operation}")]
    InvalidArgument {
        operation: &'static str,
        argument: &'static str,
    },
    #[error("A component named '{name}' is already registered")]
    AlreadyExists { name: String },
    #[error("Cannot derive context setup: {0}")]
    Environment(#[source] std::io::Error),
    #[error(transparent)]
    Load(#[from] loader::Error),
    #[error(transparent)]
    Context(#[from] context::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A successfully loaded component.
pub struct HostedComponentHandle<T: 'static> {
    name: String,
    component: Remote<T>,
    context: IsolationContext,
}

impl<T: 'static> HostedComponentHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &Remote<T> {
        &self.component
    }

    pub fn context(&self) -> &IsolationContext {
        &self.context
    }
}

impl<T: 'static> Clone for HostedComponentHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            component: self.component.clone(),
            context: self.context.clone(),
        }
    }
}

impl<T: 'static> std::fmt::Debug for HostedComponentHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedComponentHandle")
            .field("name", &self.name)
            .field("component", &self.component)
            .finish()
    }
}

enum Slot {
    Loading,
    Live(IsolationContext),
}

/// Releases a `Loading` placeholder unless the load completed.
struct Reservation<'a> {
    slots: &'a DashMap<String, Slot>,
    name: &'a str,
    armed: bool,
}

impl Reservation<'_> {
    fn complete(mut self, context: IsolationContext) {
        self.slots.insert(self.name.to_string(), Slot::Live(context));
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slots
                .remove_if(self.name, |_, slot| matches!(slot, Slot::Loading));
        }
    }
}

pub struct HostRegistry {
    slots: DashMap<String, Slot>,
    factory: IsolationContextFactory,
    loader: ComponentLoader,
    reporter: UnhandledFailureReporter,
}

impl HostRegistry {
    pub fn new(
        factory: IsolationContextFactory,
        loader: ComponentLoader,
        reporter: UnhandledFailureReporter,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            factory,
            loader,
            reporter,
        }
    }

    pub fn loader(&self) -> &ComponentLoader {
        &self.loader
    }

    /// Creates a context named `name` and loads a `T` into it.
    ///
    /// The name stays reserved while loading. Any failure after the context
    /// was created unloads it again before returning.
    pub fn create_and_load<T: HostedComponent>(&self, name: &str) -> Result<HostedComponentHandle<T>> {
        if name.is_empty() {
            return Err(Error::InvalidArgument {
                operation: "create_and_load",
                argument: "name",
            });
        }

        let reservation = self.reserve(name)?;

        let setup = self.factory.derive_setup().map_err(Error::Environment)?;
        let context = self.factory.new_context(name, setup)?;

        let component = match self.load_into::<T>(&context, name) {
            Ok(component) => component,
            Err(e) => {
                tracing::debug!(context = name, "Load failed, unloading context: {}", e);
                self.teardown(&context);
                return Err(e);
            }
        };

        self.reporter.attach(&context);
        reservation.complete(context.clone());

        tracing::info!(
            context = name,
            component = %ComponentDescriptor::of::<T>(),
            identity = %context.identity(),
            "Component loaded"
        );

        Ok(HostedComponentHandle {
            name: name.to_string(),
            component,
            context,
        })
    }

    fn reserve<'a>(&'a self, name: &'a str) -> Result<Reservation<'a>> {
        match self.slots.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists {
                name: name.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Loading);
                Ok(Reservation {
                    slots: &self.slots,
                    name,
                    armed: true,
                })
            }
        }
    }

    fn load_into<T: HostedComponent>(&self, context: &IsolationContext, name: &str) -> Result<Remote<T>> {
        let descriptor = ComponentDescriptor::of::<T>();
        let module = self.loader.resolve(&descriptor, context.setup(), name)?;
        Ok(self.loader.instantiate::<T>(context, &module, name)?)
    }

    /// Removes every entry for `context` and unloads it. Never fails.
    pub fn unload(&self, context: Option<&IsolationContext>) {
        let Some(context) = context else {
            return;
        };

        self.slots
            .retain(|_, slot| !matches!(slot, Slot::Live(live) if *live == *context));
        self.teardown(context);
    }

    /// Unloads every live entry. Safe to call concurrently; each context is
    /// destroyed by exactly one caller.
    pub fn unload_all(&self) {
        let names: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();

        for name in names {
            let removed = self
                .slots
                .remove_if(&name, |_, slot| matches!(slot, Slot::Live(_)));
            if let Some((_, Slot::Live(context))) = removed {
                self.teardown(&context);
            }
        }
    }

    fn teardown(&self, context: &IsolationContext) {
        self.reporter.detach(context);

        match context.unload() {
            Ok(()) => tracing::info!(context = context.name(), "Context unloaded"),
            Err(context::Error::AlreadyUnloaded { .. }) => {
                tracing::debug!(context = context.name(), "Context was already unloaded");
            }
            Err(e) => tracing::warn!(context = context.name(), "Failed to unload context: {}", e),
        }
    }

    /// Returns the live context registered under `name`.
    pub fn get(&self, name: &str) -> Option<IsolationContext> {
        self.slots.get(name).and_then(|entry| match entry.value() {
            Slot::Live(context) => Some(context.clone()),
            Slot::Loading => None,
        })
    }

    /// Names of the live entries, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HostRegistry {
    fn drop(&mut self) {
        self.unload_all();
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("names", &self.names())
            .finish()
    }
}
