//! Rewind Engine
//!
//! This crate provides the resumable-method lowering and a small VM to run
//! its output:
//! - **Transform**: frame analysis, suspension-site location, capture
//!   planning and continuation synthesis (`transform` module)
//! - **VM**: reference interpreter with reentrant monitors and a native
//!   future library (`vm` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use rewind_engine::{AsyncTransformer, TransformOptions};
//!
//! let transformer = AsyncTransformer::new(TransformOptions::default());
//! let report = transformer.transform_class(&mut class)?;
//!
//! let vm = Vm::new();
//! vm.load_class(&class)?;
//! let future = vm.invoke_static("demo.Main", "run", vec![])?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

// ============================================================================
// Core Modules
// ============================================================================

/// Transform module: analysis and rewriting of compiled methods
pub mod transform;

/// VM module: reference interpreter and future library
pub mod vm;

// ============================================================================
// Re-exports
// ============================================================================

pub use transform::{
    AsyncTransformer, ClassReport, CollectingSink, DiagnosticSink, Location, NameCounter,
    TracingSink, TransformError, TransformErrorKind, TransformOptions, TransformOutcome,
    TransformedMethod,
};
pub use vm::{Future, Value, Vm, VmError, VmResult};
