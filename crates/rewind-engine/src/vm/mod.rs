//! Reference VM
//!
//! A small interpreter for the Rewind instruction set, used to run
//! transformed code and compare it with the original. It provides:
//! - Reentrant, thread-owned monitors on every object
//! - Native futures with completion callbacks
//! - The `rewind.Futures` and `rewind.Async` natives
//!
//! [`Vm`] is a cheap handle; clones share classes, natives and counters, so
//! futures may be completed and callbacks run from any thread.

pub mod future;
pub mod interpreter;
pub mod monitor;
pub mod natives;
pub mod object;
pub mod value;

pub use future::{Future, Outcome};
pub use monitor::Monitor;
pub use natives::NativeFn;
pub use object::{Object, ObjectRef};
pub use value::{Closure, Value};

use crossbeam::atomic::AtomicCell;
use interpreter::{LoadedClass, PreparedMethod};
use parking_lot::{Mutex, RwLock};
use rewind_bytecode::{ClassFile, MethodRef};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// VM failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    /// A language-level exception
    #[error("uncaught exception: {0}")]
    Thrown(Value),

    /// No bytecode or native implementation for a call
    #[error("no such method: {0}")]
    NoSuchMethod(String),

    /// Class is not loaded
    #[error("no such class: {0}")]
    NoSuchClass(String),

    /// Operand of the wrong type
    #[error("type error: expected {expected}, found {found}")]
    TypeError {
        /// What the operation needs
        expected: &'static str,
        /// Class of the value found
        found: String,
    },

    /// An instruction popped an empty stack
    #[error("operand stack underflow in {0}")]
    StackUnderflow(String),

    /// A monitor was released by a thread that does not own it
    #[error("monitor is not owned by the current thread")]
    IllegalMonitorState,

    /// `get` on an unsettled future
    #[error("future is not done")]
    NotDone,

    /// A method body cannot be prepared
    #[error("invalid code in {method}: {reason}")]
    InvalidCode {
        /// Method being prepared
        method: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;

/// Allocation and scheduling counters
#[derive(Debug, Default)]
pub struct VmStats {
    closures_created: AtomicCell<u64>,
    completions_registered: AtomicCell<u64>,
    objects_allocated: AtomicCell<u64>,
}

impl VmStats {
    /// Closures created by `MakeClosure`
    pub fn closures_created(&self) -> u64 {
        self.closures_created.load()
    }

    /// Completion callbacks registered through the future library
    pub fn completions_registered(&self) -> u64 {
        self.completions_registered.load()
    }

    /// Objects created by `New`
    pub fn objects_allocated(&self) -> u64 {
        self.objects_allocated.load()
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.closures_created.store(0);
        self.completions_registered.store(0);
        self.objects_allocated.store(0);
    }

    pub(crate) fn record_closure(&self) {
        self.closures_created.fetch_add(1);
    }

    pub(crate) fn record_completion(&self) {
        self.completions_registered.fetch_add(1);
    }

    pub(crate) fn record_object(&self) {
        self.objects_allocated.fetch_add(1);
    }
}

pub(crate) struct VmShared {
    pub(crate) classes: RwLock<FxHashMap<String, Arc<LoadedClass>>>,
    pub(crate) natives: RwLock<FxHashMap<String, NativeFn>>,
    pub(crate) stats: VmStats,
    /// Monitors of static synchronized methods, one per class
    pub(crate) class_monitors: Mutex<FxHashMap<String, ObjectRef>>,
}

/// Handle to a VM instance
#[derive(Clone)]
pub struct Vm {
    pub(crate) shared: Arc<VmShared>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM with the future library installed
    pub fn new() -> Self {
        let vm = Self {
            shared: Arc::new(VmShared {
                classes: RwLock::new(FxHashMap::default()),
                natives: RwLock::new(FxHashMap::default()),
                stats: VmStats::default(),
                class_monitors: Mutex::new(FxHashMap::default()),
            }),
        };
        natives::install(&vm);
        vm
    }

    /// Load (or replace) a class
    pub fn load_class(&self, class: &ClassFile) -> VmResult<()> {
        let methods = class
            .methods
            .iter()
            .map(|m| PreparedMethod::prepare(&class.name, m).map(Arc::new))
            .collect::<VmResult<Vec<_>>>()?;
        let loaded = LoadedClass {
            superclass: class.superclass.clone(),
            methods,
        };
        tracing::debug!(class = %class.name, methods = loaded.methods.len(), "loaded class");
        self.shared
            .classes
            .write()
            .insert(class.name.clone(), Arc::new(loaded));
        Ok(())
    }

    /// Register a native implementation of `owner.name`
    ///
    /// Natives match by owner and name only, whatever the signature.
    pub fn register_native(
        &self,
        owner: &str,
        name: &str,
        f: impl Fn(&Vm, Vec<Value>) -> VmResult<Value> + Send + Sync + 'static,
    ) {
        self.shared
            .natives
            .write()
            .insert(format!("{}.{}", owner, name), Arc::new(f));
    }

    /// Counters
    pub fn stats(&self) -> &VmStats {
        &self.shared.stats
    }

    /// Allocate an object without running a constructor
    pub fn new_object(&self, class: &str) -> Value {
        self.shared.stats.record_object();
        Value::Object(Arc::new(Object::new(class)))
    }

    /// Call a method; the receiver, if any, is the first argument
    pub fn invoke(&self, method: &MethodRef, args: Vec<Value>) -> VmResult<Value> {
        self.call(method, None, args)
    }

    /// Call the method of `owner` named `name` taking `args.len()` arguments
    pub fn invoke_static(&self, owner: &str, name: &str, args: Vec<Value>) -> VmResult<Value> {
        let class = self.class(owner)?;
        let method = class
            .methods
            .iter()
            .find(|m| m.method.name == name && m.arity() == args.len())
            .cloned()
            .ok_or_else(|| VmError::NoSuchMethod(format!("{}.{}", owner, name)))?;
        self.execute(&method, args)
    }

    /// Call a closure with additional arguments
    pub fn call_closure(&self, closure: &Closure, args: Vec<Value>) -> VmResult<Value> {
        let mut all = closure.captured.clone();
        all.extend(args);
        self.invoke(&closure.method, all)
    }

    pub(crate) fn class(&self, name: &str) -> VmResult<Arc<LoadedClass>> {
        self.shared
            .classes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::NoSuchClass(name.to_string()))
    }

    pub(crate) fn native(&self, owner: &str, name: &str) -> Option<NativeFn> {
        self.shared
            .natives
            .read()
            .get(&format!("{}.{}", owner, name))
            .cloned()
    }

    pub(crate) fn class_monitor(&self, class: &str) -> ObjectRef {
        Arc::clone(
            self.shared
                .class_monitors
                .lock()
                .entry(class.to_string())
                .or_insert_with(|| Arc::new(Object::new(class))),
        )
    }
}
