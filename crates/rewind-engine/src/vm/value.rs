//! Runtime values

use super::future::Future;
use super::object::ObjectRef;
use super::{VmError, VmResult};
use rewind_bytecode::names::{CLOSURE_CLASS, FUTURE_CLASS, OBJECT_CLASS, STRING_CLASS};
use rewind_bytecode::{Constant, MethodRef, Type, ValueKind};
use std::fmt;
use std::sync::Arc;

/// A value on the operand stack, in a local or in a field
///
/// Primitives and strings compare by value; objects, futures and closures
/// compare by identity.
#[derive(Clone)]
pub enum Value {
    /// The null reference
    Null,
    /// 32-bit integer (also booleans)
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Heap object
    Object(ObjectRef),
    /// Future from the native future library
    Future(Future),
    /// Bound closure
    Closure(Arc<Closure>),
}

/// A method together with its leading arguments
#[derive(Debug)]
pub struct Closure {
    /// Method called when the closure is invoked
    pub method: MethodRef,
    /// Arguments passed before the call arguments
    pub captured: Vec<Value>,
}

impl Value {
    /// String value
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Value pushed by a constant
    pub fn from_constant(c: &Constant) -> Self {
        match c {
            Constant::Null => Value::Null,
            Constant::Int(v) => Value::Int(*v),
            Constant::Long(v) => Value::Long(*v),
            Constant::Float(v) => Value::Float(*v),
            Constant::Double(v) => Value::Double(*v),
            Constant::Str(s) => Value::str(s),
        }
    }

    /// Zero or null of a computational kind
    pub fn default_for(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => Value::Int(0),
            ValueKind::Long => Value::Long(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Ref => Value::Null,
        }
    }

    /// Zero or null of a declared type
    pub fn default_for_type(ty: &Type) -> Self {
        ty.kind().map(Value::default_for).unwrap_or(Value::Null)
    }

    /// Runtime class name, used for dispatch and handler matching
    pub fn class_name(&self) -> &str {
        match self {
            Value::Null => OBJECT_CLASS,
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => STRING_CLASS,
            Value::Object(obj) => obj.class(),
            Value::Future(_) => FUTURE_CLASS,
            Value::Closure(_) => CLOSURE_CLASS,
        }
    }

    /// Whether this is the null reference
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn type_error(&self, expected: &'static str) -> VmError {
        VmError::TypeError {
            expected,
            found: self.class_name().to_string(),
        }
    }

    /// The integer payload
    pub fn as_int(&self) -> VmResult<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(other.type_error("int")),
        }
    }

    /// The long payload
    pub fn as_long(&self) -> VmResult<i64> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(other.type_error("long")),
        }
    }

    /// The float payload
    pub fn as_float(&self) -> VmResult<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(other.type_error("float")),
        }
    }

    /// The double payload
    pub fn as_double(&self) -> VmResult<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(other.type_error("double")),
        }
    }

    /// The referenced object
    pub fn as_object(&self) -> VmResult<&ObjectRef> {
        match self {
            Value::Object(obj) => Ok(obj),
            other => Err(other.type_error("object")),
        }
    }

    /// The referenced future
    pub fn as_future(&self) -> VmResult<&Future> {
        match self {
            Value::Future(f) => Ok(f),
            other => Err(other.type_error("future")),
        }
    }

    /// The referenced closure
    pub fn as_closure(&self) -> VmResult<&Arc<Closure>> {
        match self {
            Value::Closure(c) => Ok(c),
            other => Err(other.type_error("closure")),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Future(a), Value::Future(b)) => a.ptr_eq(b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) => write!(f, "{}f", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(obj) => write!(f, "{}@{:p}", obj.class(), Arc::as_ptr(obj)),
            Value::Future(fut) => {
                let state = if fut.is_done() { "done" } else { "pending" };
                write!(f, "future({})", state)
            }
            Value::Closure(c) => write!(f, "closure {}.{}", c.method.owner, c.method.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<Future> for Value {
    fn from(f: Future) -> Self {
        Value::Future(f)
    }
}
