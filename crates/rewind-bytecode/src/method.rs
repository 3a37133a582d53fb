//! Compiled method and class formats

use crate::insn::{Insn, LabelId};
use crate::list::InsnList;
use crate::types::{MethodRef, Signature, Type};
use serde::{Deserialize, Serialize};

/// Exception region: instructions between `start` and `end` are guarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    /// First guarded label (inclusive)
    pub start: LabelId,
    /// End of the guarded range (exclusive)
    pub end: LabelId,
    /// Handler entry
    pub handler: LabelId,
    /// Caught class, `None` catches everything
    pub catch_type: Option<String>,
}

/// Debug entry naming a local slot over a label range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariable {
    /// Source-level name
    pub name: String,
    /// Local slot
    pub slot: u16,
    /// Declared type
    pub ty: Type,
    /// Start of the live range (inclusive)
    pub start: LabelId,
    /// End of the live range (exclusive)
    pub end: LabelId,
}

/// An already-compiled, typed method body with its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledMethod {
    /// Method name
    pub name: String,
    /// Parameter and return types
    pub sig: Signature,
    /// No receiver in local 0
    #[serde(default)]
    pub is_static: bool,
    /// The receiver's (or class's) monitor is held for the whole call
    #[serde(default)]
    pub is_synchronized: bool,
    /// Generated by a tool rather than written by hand
    #[serde(default)]
    pub is_synthetic: bool,
    /// Declared exception types
    #[serde(default)]
    pub throws: Vec<String>,
    /// Free-form generic signature, if the source language has one
    #[serde(default)]
    pub generic_signature: Option<String>,
    /// Maximum operand stack depth
    #[serde(default)]
    pub max_stack: u16,
    /// Number of local variable slots
    #[serde(default)]
    pub max_locals: u16,
    /// Instruction stream
    pub code: InsnList,
    /// Exception regions, innermost first
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
    /// Local variable debug table
    #[serde(default)]
    pub local_vars: Vec<LocalVariable>,
    /// Next unused label number
    #[serde(default)]
    pub next_label: u32,
}

impl CompiledMethod {
    /// Create an empty method
    pub fn new(name: impl Into<String>, sig: Signature, is_static: bool) -> Self {
        let mut method = Self {
            name: name.into(),
            sig,
            is_static,
            is_synchronized: false,
            is_synthetic: false,
            throws: Vec::new(),
            generic_signature: None,
            max_stack: 0,
            max_locals: 0,
            code: InsnList::new(),
            handlers: Vec::new(),
            local_vars: Vec::new(),
            next_label: 0,
        };
        method.max_locals = method.param_slots();
        method
    }

    /// Allocate a fresh label
    pub fn new_label(&mut self) -> LabelId {
        self.sync_label_counter();
        let label = LabelId(self.next_label);
        self.next_label += 1;
        label
    }

    /// Make sure `next_label` is above every label used in the body
    ///
    /// Methods read from JSON may omit the counter.
    pub fn sync_label_counter(&mut self) {
        let mut max = self.next_label;
        let mut bump = |l: LabelId| max = max.max(l.0 + 1);
        for (_, insn) in self.code.iter() {
            if let Insn::Label(l) = insn {
                bump(*l);
            }
            for l in insn.targets() {
                bump(l);
            }
        }
        for h in &self.handlers {
            bump(h.start);
            bump(h.end);
            bump(h.handler);
        }
        self.next_label = max;
    }

    /// Local slots taken by the receiver and parameters
    pub fn param_slots(&self) -> u16 {
        self.sig.param_slots() + u16::from(!self.is_static)
    }

    /// Reference to this method as declared in `owner`
    pub fn reference(&self, owner: &str) -> MethodRef {
        MethodRef::new(owner, self.name.clone(), self.sig.clone())
    }

    /// Source line of the first `Line` marker, if any
    pub fn first_line(&self) -> Option<u32> {
        self.code.iter().find_map(|(_, insn)| match insn {
            Insn::Line(line) => Some(*line),
            _ => None,
        })
    }
}

/// Field declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Declared type
    pub ty: Type,
}

/// A class: the unit the transform installs continuation methods into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFile {
    /// Fully qualified class name
    pub name: String,
    /// Superclass, `None` for root classes
    #[serde(default)]
    pub superclass: Option<String>,
    /// Instance fields
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Methods
    #[serde(default)]
    pub methods: Vec<CompiledMethod>,
}

impl ClassFile {
    /// Create an empty class
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Find a method by name and exact signature
    pub fn find_method(&self, name: &str, sig: &Signature) -> Option<&CompiledMethod> {
        self.methods.iter().find(|m| m.name == name && &m.sig == sig)
    }

    /// Whether any method has this name
    pub fn has_method_named(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }

    /// Parse a class from JSON
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut class: ClassFile = serde_json::from_str(text)?;
        for method in &mut class.methods {
            method.sync_label_counter();
        }
        Ok(class)
    }

    /// Serialize the class as pretty JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
