//! Rewind Bytecode Definitions
//!
//! This crate provides the typed stack-machine instruction set, the
//! instruction arena, the compiled method and class formats, and a
//! structural verifier used by the Rewind transform and VM.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod insn;
pub mod list;
pub mod method;
pub mod names;
pub mod pretty;
pub mod types;
pub mod verify;

pub use builder::MethodBuilder;
pub use insn::{ArithOp, Cond, Constant, FrameAssertion, FrameType, Insn, InvokeKind, LabelId};
pub use list::{InsnId, InsnList};
pub use method::{ClassFile, CompiledMethod, ExceptionHandler, FieldDef, LocalVariable};
pub use types::{MethodRef, Signature, Type, ValueKind};
pub use verify::{verify_class, verify_method, VerifyError};
