//! # Isolated Contexts
//!
//! An [`IsolationContext`] is a dedicated thread owning a current-thread Tokio
//! runtime, an object table and a thread-scoped `tracing` dispatcher. Objects
//! created inside a context never leave its thread; the host reaches them by
//! sending jobs over the command channel and waiting for the reply.
//!
//! # Lifecycle
//!
//! A context is running from the moment [`IsolationContext::spawn`] returns
//! until [`IsolationContext::unload`] is called or the last handle is dropped.
//! Unloading drops every object on the context thread, shuts the runtime down
//! (abandoning any outstanding tasks) and joins the thread. The unloaded flag
//! is swapped atomically, so of any number of concurrent unload calls exactly
//! one performs the teardown and the rest see `AlreadyUnloaded`.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::thread::ThreadId;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;

use crate::exec_id;
use crate::exec_id::ExecutionId;
use crate::fault::Fault;
use crate::fault::FaultHooks;
use crate::remote::CallError;
use crate::remote::ObjectId;
use crate::remote::Remote;
use crate::trace::HubLayer;
use crate::trace::TraceHub;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to spawn thread for context '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to start runtime for context '{name}': {reason}")]
    Runtime { name: String, reason: String },
    #[error("Context '{name}' is already unloaded")]
    AlreadyUnloaded { name: String },
    #[error("Context '{name}' cannot be unloaded from its own thread")]
    UnloadFromWithin { name: String },
    #[error("Failed to unload context '{name}': {reason}")]
    UnloadFailed { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration an isolated context is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSetup {
    /// Directory component modules are resolved against.
    pub application_base: PathBuf,
    /// Configuration source handed down from the host, if any.
    pub configuration_file: Option<PathBuf>,
    /// Load modules from a private copy instead of the original file.
    pub shadow_copy_files: bool,
    /// Directories subject to shadow copying. Empty means all of them.
    pub shadow_copy_directories: Vec<PathBuf>,
    /// Root of the shadow copy cache.
    pub cache_path: Option<PathBuf>,
    /// Most verbose level captured by the context's trace hub.
    pub trace_level: Level,
}

impl ContextSetup {
    /// Returns true if modules in `dir` should be shadow copied.
    pub fn shadow_copies(&self, dir: &std::path::Path) -> bool {
        self.shadow_copy_files
            && self.cache_path.is_some()
            && (self.shadow_copy_directories.is_empty()
                || self.shadow_copy_directories.iter().any(|d| dir.starts_with(d)))
    }
}

type Job = Box<dyn FnOnce(&mut ContextState) + Send>;

enum Command {
    Run(Job),
    Unload,
}

thread_local! {
    static CURRENT: RefCell<Option<ContextEnv>> = const { RefCell::new(None) };
}

/// Returns the environment of the context the calling thread belongs to.
///
/// Hosted code uses this to find its own name, trace hub and runtime. Returns
/// `None` on threads that are not context threads.
pub fn current() -> Option<ContextEnv> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Everything a context exposes to the code running inside it.
#[derive(Clone)]
pub struct ContextEnv {
    name: Arc<str>,
    setup: Arc<ContextSetup>,
    hub: TraceHub,
    faults: FaultHooks,
    exec_id: Arc<ExecutionId>,
    runtime: Handle,
}

impl ContextEnv {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setup(&self) -> &ContextSetup {
        &self.setup
    }

    /// The context's own trace sink.
    pub fn trace(&self) -> &TraceHub {
        &self.hub
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.exec_id
    }

    /// `<friendly name>-<short execution id>` of this context.
    pub fn identity(&self) -> String {
        exec_id::identity(&self.name, &self.exec_id)
    }

    /// Spawns a background task on the context runtime.
    ///
    /// A panic in the task is raised as a fault on the context instead of
    /// being lost with the join handle.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let faults = self.faults.clone();
        let name = self.name.clone();
        let task = self.runtime.spawn(future);
        self.runtime.spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    let payload = err.into_panic();
                    faults.raise(&Fault {
                        context: name.to_string(),
                        message: panic_message(&*payload),
                    });
                }
            }
        });
    }

    pub(crate) fn raise_fault(&self, message: String) -> usize {
        self.faults.raise(&Fault {
            context: self.name.to_string(),
            message,
        })
    }
}

impl std::fmt::Debug for ContextEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEnv")
            .field("name", &self.name)
            .field("setup", &self.setup)
            .finish()
    }
}

/// State owned by the context thread. Jobs receive it by mutable reference.
pub struct ContextState {
    env: ContextEnv,
    objects: HashMap<ObjectId, Box<dyn Any>>,
    next_object: u64,
}

impl ContextState {
    fn new(env: ContextEnv) -> Self {
        Self {
            env,
            objects: HashMap::new(),
            next_object: 1,
        }
    }

    pub fn env(&self) -> &ContextEnv {
        &self.env
    }

    /// Adds an object to the table and returns its id.
    pub fn insert(&mut self, object: Box<dyn Any>) -> ObjectId {
        let id = ObjectId(self.next_object);
        self.next_object += 1;
        self.objects.insert(id, object);
        id
    }

    /// Returns the object if it exists and is a `T`.
    pub fn object_mut<T: 'static>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.objects.get_mut(&id)?.downcast_mut::<T>()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Drops an object. Returns false if it did not exist.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        self.objects.remove(&id).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn teardown(&mut self) {
        let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        ids.sort_by_key(|id| std::cmp::Reverse(id.0));
        for id in ids {
            let Some(object) = self.objects.remove(&id) else {
                continue;
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(object))) {
                self.env.raise_fault(panic_message(&*payload));
            }
        }
    }
}

/// Handle to an isolated context. Clones refer to the same context.
#[derive(Clone)]
pub struct IsolationContext {
    inner: Arc<Inner>,
}

struct Inner {
    name: Arc<str>,
    setup: Arc<ContextSetup>,
    hub: TraceHub,
    faults: FaultHooks,
    exec_id: Arc<ExecutionId>,
    commands: mpsc::UnboundedSender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    unloaded: AtomicBool,
}

impl IsolationContext {
    /// Starts a context thread and waits until its runtime is ready.
    pub fn spawn(name: &str, setup: ContextSetup) -> Result<Self> {
        let name: Arc<str> = Arc::from(name);
        let setup = Arc::new(setup);
        let hub = TraceHub::new();
        let faults = FaultHooks::new();
        let exec_id = Arc::new(ExecutionId::new());

        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let seed = Seed {
            name: name.clone(),
            setup: setup.clone(),
            hub: hub.clone(),
            faults: faults.clone(),
            exec_id: exec_id.clone(),
        };

        let thread = std::thread::Builder::new()
            .name(format!("hostrun-{}", name))
            .spawn(move || run_context(seed, rx, ready_tx))
            .map_err(|source| Error::Spawn {
                name: name.to_string(),
                source,
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = thread.join();
                return Err(Error::Runtime {
                    name: name.to_string(),
                    reason,
                });
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Runtime {
                    name: name.to_string(),
                    reason: "context thread exited during startup".into(),
                });
            }
        }

        let thread_id = thread.thread().id();
        tracing::debug!(context = %name, "Isolation context started");

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                setup,
                hub,
                faults,
                exec_id,
                commands,
                thread: Mutex::new(Some(thread)),
                thread_id,
                unloaded: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn setup(&self) -> &ContextSetup {
        &self.inner.setup
    }

    /// The context's own trace sink.
    pub fn trace(&self) -> &TraceHub {
        &self.inner.hub
    }

    pub fn faults(&self) -> &FaultHooks {
        &self.inner.faults
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.inner.exec_id
    }

    /// Trace identity of code running inside this context.
    pub fn identity(&self) -> String {
        exec_id::identity(&self.inner.name, &self.inner.exec_id)
    }

    pub fn is_unloaded(&self) -> bool {
        self.inner.unloaded.load(Ordering::Acquire)
    }

    fn is_context_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    fn peer_gone(&self) -> CallError {
        CallError::PeerGone {
            context: self.name().to_string(),
        }
    }

    /// Runs `f` on the context thread and blocks until it returns.
    ///
    /// A panic inside `f` is caught on the context thread and reported as
    /// `Faulted`; the context keeps running. `PeerGone` means the context was
    /// unloaded before or while the call was processed.
    pub fn invoke<R, F>(&self, f: F) -> std::result::Result<R, CallError>
    where
        F: FnOnce(&mut ContextState) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_unloaded() {
            return Err(self.peer_gone());
        }
        if self.is_context_thread() {
            return Err(CallError::Reentrant {
                context: self.name().to_string(),
            });
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move |state| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(state)))
                .map_err(|payload| panic_message(&*payload));
            let _ = reply_tx.send(outcome);
        });

        self.inner
            .commands
            .send(Command::Run(job))
            .map_err(|_| self.peer_gone())?;

        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(CallError::Faulted {
                context: self.name().to_string(),
                message,
            }),
            Err(_) => Err(self.peer_gone()),
        }
    }

    /// Queues `f` on the context thread without waiting for it.
    ///
    /// A panic inside `f` is raised on the context's fault hooks.
    pub fn post<F>(&self, f: F) -> std::result::Result<(), CallError>
    where
        F: FnOnce(&mut ContextState) + Send + 'static,
    {
        if self.is_unloaded() {
            return Err(self.peer_gone());
        }
        self.inner
            .commands
            .send(Command::Run(Box::new(f)))
            .map_err(|_| self.peer_gone())
    }

    /// Constructs an object inside the context and returns a typed stub for it.
    pub fn create_object<T, F>(&self, ctor: F) -> std::result::Result<Remote<T>, CallError>
    where
        T: 'static,
        F: FnOnce(&ContextEnv) -> T + Send + 'static,
    {
        let object = self.invoke(move |state| {
            let value = ctor(state.env());
            state.insert(Box::new(value))
        })?;
        Ok(Remote::new(self.clone(), object))
    }

    /// Tears the context down and waits for its thread to exit.
    pub fn unload(&self) -> Result<()> {
        if self.is_context_thread() {
            return Err(Error::UnloadFromWithin {
                name: self.name().to_string(),
            });
        }
        if self.inner.unloaded.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyUnloaded {
                name: self.name().to_string(),
            });
        }

        let _ = self.inner.commands.send(Command::Unload);
        let thread = self.inner.thread.lock().take();
        match thread {
            Some(handle) => handle.join().map_err(|payload| Error::UnloadFailed {
                name: self.name().to_string(),
                reason: panic_message(&*payload),
            }),
            None => Ok(()),
        }
    }
}

impl PartialEq for IsolationContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for IsolationContext {}

impl std::fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationContext")
            .field("name", &self.inner.name)
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Unload);
        if let Some(handle) = self.thread.get_mut().take() {
            if std::thread::current().id() != self.thread_id {
                let _ = handle.join();
            }
        }
    }
}

/// Pieces of the environment built on the host side before the thread starts.
struct Seed {
    name: Arc<str>,
    setup: Arc<ContextSetup>,
    hub: TraceHub,
    faults: FaultHooks,
    exec_id: Arc<ExecutionId>,
}

fn run_context(
    seed: Seed,
    mut rx: mpsc::UnboundedReceiver<Command>,
    ready: crossbeam_channel::Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    let env = ContextEnv {
        name: seed.name,
        setup: seed.setup,
        hub: seed.hub,
        faults: seed.faults,
        exec_id: seed.exec_id,
        runtime: runtime.handle().clone(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(LevelFilter::from_level(env.setup.trace_level))
        .with(HubLayer::new(env.hub.clone()));
    let dispatch_guard = tracing::subscriber::set_default(subscriber);

    CURRENT.with(|current| *current.borrow_mut() = Some(env.clone()));
    let _ = ready.send(Ok(()));

    let mut state = ContextState::new(env);

    runtime.block_on(async {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Run(job) => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
                        state.env.raise_fault(panic_message(&*payload));
                    }
                }
                Command::Unload => break,
            }
        }
        rx.close();
    });

    tracing::debug!(context = %state.env.name, "Isolation context unloading");
    state.teardown();
    // Queued jobs are dropped here, which fails their callers with PeerGone.
    drop(rx);
    drop(runtime);

    CURRENT.with(|current| current.borrow_mut().take());
    drop(state);
    drop(dispatch_guard);
}

/// Renders a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
