//! Value types, computational kinds and method signatures

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a parameter, return value, field or local variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    /// No value (return types only)
    Void,
    /// Boolean, computed as `Int`
    Bool,
    /// 32-bit integer
    Int,
    /// 64-bit integer (two local slots)
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float (two local slots)
    Double,
    /// Reference to an instance of the named class
    Object(String),
}

impl Type {
    /// Shorthand for `Type::Object`
    pub fn object(class: impl Into<String>) -> Self {
        Type::Object(class.into())
    }

    /// Number of local variable slots a value of this type occupies
    pub fn slots(&self) -> u16 {
        match self {
            Type::Void => 0,
            Type::Long | Type::Double => 2,
            _ => 1,
        }
    }

    /// Whether the type occupies two local slots
    pub fn is_wide(&self) -> bool {
        self.slots() == 2
    }

    /// Computational kind, `None` for `Void`
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Type::Void => None,
            Type::Bool | Type::Int => Some(ValueKind::Int),
            Type::Long => Some(ValueKind::Long),
            Type::Float => Some(ValueKind::Float),
            Type::Double => Some(ValueKind::Double),
            Type::Object(_) => Some(ValueKind::Ref),
        }
    }

    /// Class name for reference types
    pub fn class_name(&self) -> Option<&str> {
        match self {
            Type::Object(name) => Some(name),
            _ => None,
        }
    }

    /// Whether this is a reference to the named class
    pub fn is_class(&self, class: &str) -> bool {
        self.class_name() == Some(class)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Long => write!(f, "long"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Object(name) => write!(f, "{}", name),
        }
    }
}

/// Computational kind of a stack value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// 32-bit integer (also booleans)
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Object reference or null
    Ref,
}

impl ValueKind {
    /// Whether a local of this kind occupies two slots
    pub fn is_wide(self) -> bool {
        matches!(self, ValueKind::Long | ValueKind::Double)
    }

    /// Number of local variable slots
    pub fn slots(self) -> u16 {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    /// Short mnemonic prefix used by the pretty-printer
    pub fn prefix(self) -> &'static str {
        match self {
            ValueKind::Int => "i",
            ValueKind::Long => "l",
            ValueKind::Float => "f",
            ValueKind::Double => "d",
            ValueKind::Ref => "a",
        }
    }
}

/// Parameter and return types of a method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Declared parameter types (excluding the receiver)
    pub params: Vec<Type>,
    /// Declared return type
    pub ret: Type,
}

impl Signature {
    /// Create a signature
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }

    /// Total local slots taken by the parameters (excluding the receiver)
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(Type::slots).sum()
    }

    /// Whether any parameter or the return type satisfies `pred`
    pub fn mentions(&self, pred: impl Fn(&Type) -> bool) -> bool {
        self.params.iter().any(&pred) || pred(&self.ret)
    }

    /// Copy of this signature with every type passed through `f`
    pub fn map_types(&self, f: impl Fn(&Type) -> Type) -> Signature {
        Signature {
            params: self.params.iter().map(&f).collect(),
            ret: f(&self.ret),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Reference to a method: owner class, name and signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Declaring class
    pub owner: String,
    /// Method name
    pub name: String,
    /// Method signature
    pub sig: Signature,
}

impl MethodRef {
    /// Create a method reference
    pub fn new(owner: impl Into<String>, name: impl Into<String>, sig: Signature) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            sig,
        }
    }

    /// Whether this refers to `owner.name`, ignoring the signature
    pub fn is(&self, owner: &str, name: &str) -> bool {
        self.owner == owner && self.name == name
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.sig)
    }
}
