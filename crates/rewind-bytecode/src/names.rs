//! Well-known runtime names
//!
//! Class and method names the transform emits calls to and the VM
//! provides natively. They are the defaults of the transform options and
//! can be overridden there.

/// The canonical future/promise type
pub const FUTURE_CLASS: &str = "rewind.Future";

/// The surface "awaitable" marker type; never survives the transform
pub const AWAITABLE_CLASS: &str = "rewind.Awaitable";

/// Owner of the surface `await`, `all` and `map` primitives
pub const ASYNC_CLASS: &str = "rewind.Async";

/// Owner of the future library operations
pub const FUTURES_CLASS: &str = "rewind.Futures";

/// Root of the class hierarchy
pub const OBJECT_CLASS: &str = "rewind.Object";

/// Type of string constants
pub const STRING_CLASS: &str = "rewind.String";

/// Type of values produced by `MakeClosure`
pub const CLOSURE_CLASS: &str = "rewind.Closure";

/// Name of constructor methods
pub const CONSTRUCTOR: &str = "<init>";

/// Name of the await primitive on [`ASYNC_CLASS`]
pub const AWAIT_METHOD: &str = "await";

/// Name of the "wait for all" composition helper
pub const ALL_METHOD: &str = "all";

/// Name of the mapping combinator
pub const MAP_METHOD: &str = "map";

/// Future library: is the future settled?
pub const IS_DONE_METHOD: &str = "isDone";

/// Future library: value of a settled future (or rethrow its failure)
pub const GET_METHOD: &str = "get";

/// Future library: run a closure when the future settles
pub const RUN_ON_COMPLETION_METHOD: &str = "runOnCompletion";

/// Future library: chain a future-returning closure onto a future
pub const COMPOSE_METHOD: &str = "compose";

/// Future library: already-completed future
pub const COMPLETED_METHOD: &str = "completed";

/// Future library: already-failed future
pub const REJECTED_METHOD: &str = "rejected";

/// Future library: new unsettled future
pub const PENDING_METHOD: &str = "pending";

/// Owner of runtime services that are not part of the future library
pub const RUNTIME_CLASS: &str = "rewind.Runtime";

/// Runtime: the monitor a static synchronized method of a class locks
pub const CLASS_MONITOR_METHOD: &str = "classMonitor";
