//! Instruction set for the Rewind stack machine
//!
//! Instructions are typed: loads, stores and arithmetic carry the
//! computational kind of their operands, and calls carry full method
//! references. Control flow targets are symbolic [`LabelId`]s placed in the
//! instruction stream with [`Insn::Label`], so instructions can be inserted
//! and moved freely without patching offsets.
//!
//! Instructions are organized into categories:
//! - Pseudo instructions: labels, line markers, frame assertions
//! - Constants and stack manipulation
//! - Local variables
//! - Arithmetic and conversion
//! - Control flow
//! - Objects, calls and closures
//! - Synchronization and exceptions

use crate::types::{MethodRef, Signature, Type, ValueKind};
use serde::{Deserialize, Serialize};

/// Symbolic jump target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

/// Constant operand of [`Insn::Const`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    /// The null reference
    Null,
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// String constant
    Str(String),
}

impl Constant {
    /// Computational kind of the pushed value
    pub fn kind(&self) -> ValueKind {
        match self {
            Constant::Null | Constant::Str(_) => ValueKind::Ref,
            Constant::Int(_) => ValueKind::Int,
            Constant::Long(_) => ValueKind::Long,
            Constant::Float(_) => ValueKind::Float,
            Constant::Double(_) => ValueKind::Double,
        }
    }

    /// Canonical zero/null value for a kind
    pub fn default_for(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => Constant::Int(0),
            ValueKind::Long => Constant::Long(0),
            ValueKind::Float => Constant::Float(0.0),
            ValueKind::Double => Constant::Double(0.0),
            ValueKind::Ref => Constant::Null,
        }
    }
}

/// Binary arithmetic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Branch condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    /// Evaluate the condition on an ordering result
    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Cond::Eq => ord == Equal,
            Cond::Ne => ord != Equal,
            Cond::Lt => ord == Less,
            Cond::Ge => ord != Less,
            Cond::Gt => ord == Greater,
            Cond::Le => ord != Greater,
        }
    }
}

/// Dispatch mode of [`Insn::Invoke`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeKind {
    /// No receiver
    Static,
    /// Receiver below the arguments, dispatched on its runtime class
    Virtual,
    /// Constructor call on a freshly allocated receiver
    Constructor,
}

/// Slot type in a [`FrameAssertion`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum FrameType {
    /// Unusable slot (including the upper half of a wide local)
    Top,
    Int,
    Long,
    Float,
    Double,
    Null,
    /// Initialized reference of the named class
    Object(String),
    /// Allocated but not constructed; the label precedes the `New`
    Uninitialized(LabelId),
}

/// Frame checkpoint computed by an upstream tool
///
/// `locals` is slot-indexed: a wide local is followed by `Top`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameAssertion {
    /// Local variable slot types
    pub locals: Vec<FrameType>,
    /// Operand stack types, bottom first
    pub stack: Vec<FrameType>,
}

/// A single instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Insn {
    // ===== Pseudo instructions =====
    /// No operation
    Nop,
    /// Jump target marker
    Label(LabelId),
    /// Source line of the following instructions
    Line(u32),
    /// Frame checkpoint for the following instruction
    Frame(FrameAssertion),

    // ===== Constants & stack =====
    /// Push a constant
    Const(Constant),
    /// Pop the top value
    Pop,
    /// Duplicate the top value
    Dup,
    /// `.. b a` → `.. a b a`
    DupX1,
    /// Swap the two top values
    Swap,

    // ===== Locals =====
    /// Push local `slot`
    Load { kind: ValueKind, slot: u16 },
    /// Pop into local `slot`
    Store { kind: ValueKind, slot: u16 },

    // ===== Arithmetic =====
    /// Pop b, pop a, push `a op b`
    Arith { op: ArithOp, kind: ValueKind },
    /// Pop a, push -a
    Neg(ValueKind),
    /// Pop a of kind `from`, push it converted to `to`
    Convert { from: ValueKind, to: ValueKind },
    /// Pop b, pop a, push int -1/0/1
    Compare(ValueKind),

    // ===== Control flow =====
    /// Unconditional jump
    Jump(LabelId),
    /// Pop an int, jump if `value cond 0`
    If { cond: Cond, target: LabelId },
    /// Pop b, pop a (ints), jump if `a cond b`
    IfCmp { cond: Cond, target: LabelId },
    /// Pop a reference, jump if null
    IfNull(LabelId),
    /// Pop a reference, jump if not null
    IfNonNull(LabelId),
    /// Pop an int, jump to the matching case or `default`
    Switch {
        cases: Vec<(i32, LabelId)>,
        default: LabelId,
    },

    // ===== Objects & calls =====
    /// Allocate an unconstructed instance
    New(String),
    /// Pop a reference, push it as the named class
    CheckCast(String),
    /// Pop object, push field value
    GetField { owner: String, name: String, ty: Type },
    /// Pop value, pop object, store field
    PutField { owner: String, name: String, ty: Type },
    /// Call a method
    Invoke { kind: InvokeKind, method: MethodRef },
    /// Pop the first `captured` arguments of `method`, push a closure
    MakeClosure { method: MethodRef, captured: usize },
    /// Pop arguments, pop closure, call it
    InvokeClosure { sig: Signature },

    // ===== Synchronization & exceptions =====
    /// Pop a reference and acquire its monitor
    MonitorEnter,
    /// Pop a reference and release its monitor
    MonitorExit,
    /// Pop a reference and throw it
    Throw,
    /// Return, popping a value of the given kind if any
    Return(Option<ValueKind>),
}

impl Insn {
    /// Whether execution never continues with the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Insn::Jump(_) | Insn::Switch { .. } | Insn::Throw | Insn::Return(_)
        )
    }

    /// Whether the instruction is a label, line marker, frame assertion or nop
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Insn::Nop | Insn::Label(_) | Insn::Line(_) | Insn::Frame(_))
    }

    /// Labels this instruction may jump to
    pub fn targets(&self) -> Vec<LabelId> {
        match self {
            Insn::Jump(target)
            | Insn::If { target, .. }
            | Insn::IfCmp { target, .. }
            | Insn::IfNull(target)
            | Insn::IfNonNull(target) => vec![*target],
            Insn::Switch { cases, default } => {
                let mut out: Vec<LabelId> = cases.iter().map(|(_, l)| *l).collect();
                out.push(*default);
                out
            }
            _ => Vec::new(),
        }
    }

    /// Number of operand stack entries (pops, pushes)
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Insn::Nop | Insn::Label(_) | Insn::Line(_) | Insn::Frame(_) => (0, 0),
            Insn::Const(_) | Insn::Load { .. } | Insn::New(_) => (0, 1),
            Insn::Store { .. } | Insn::Pop => (1, 0),
            Insn::Dup => (1, 2),
            Insn::DupX1 => (2, 3),
            Insn::Swap => (2, 2),
            Insn::Arith { .. } | Insn::Compare(_) => (2, 1),
            Insn::Neg(_) | Insn::Convert { .. } | Insn::CheckCast(_) => (1, 1),
            Insn::Jump(_) => (0, 0),
            Insn::If { .. } | Insn::IfNull(_) | Insn::IfNonNull(_) | Insn::Switch { .. } => (1, 0),
            Insn::IfCmp { .. } => (2, 0),
            Insn::GetField { .. } => (1, 1),
            Insn::PutField { .. } => (2, 0),
            Insn::Invoke { kind, method } => {
                let receiver = usize::from(*kind != InvokeKind::Static);
                let pushes = usize::from(method.sig.ret != Type::Void);
                (method.sig.params.len() + receiver, pushes)
            }
            Insn::MakeClosure { captured, .. } => (*captured, 1),
            Insn::InvokeClosure { sig } => {
                (sig.params.len() + 1, usize::from(sig.ret != Type::Void))
            }
            Insn::MonitorEnter | Insn::MonitorExit | Insn::Throw => (1, 0),
            Insn::Return(kind) => (usize::from(kind.is_some()), 0),
        }
    }

    /// Local slot read or written by this instruction, with its kind
    pub fn local_access(&self) -> Option<(u16, ValueKind)> {
        match self {
            Insn::Load { kind, slot } | Insn::Store { kind, slot } => Some((*slot, *kind)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminators() {
        assert!(Insn::Return(None).is_terminator());
        assert!(Insn::Throw.is_terminator());
        assert!(Insn::Jump(LabelId(0)).is_terminator());
        assert!(!Insn::If { cond: Cond::Eq, target: LabelId(0) }.is_terminator());
        assert!(!Insn::Pop.is_terminator());
    }

    #[test]
    fn test_switch_targets() {
        let insn = Insn::Switch {
            cases: vec![(0, LabelId(1)), (1, LabelId(2))],
            default: LabelId(3),
        };
        assert_eq!(insn.targets(), vec![LabelId(1), LabelId(2), LabelId(3)]);
    }

    #[test]
    fn test_invoke_stack_effect() {
        let method = MethodRef::new(
            "a.B",
            "f",
            Signature::new(vec![Type::Int, Type::Long], Type::Int),
        );
        let virt = Insn::Invoke { kind: InvokeKind::Virtual, method: method.clone() };
        let stat = Insn::Invoke { kind: InvokeKind::Static, method };
        assert_eq!(virt.stack_effect(), (3, 1));
        assert_eq!(stat.stack_effect(), (2, 1));
    }

    #[test]
    fn test_cond_holds() {
        use std::cmp::Ordering;
        assert!(Cond::Le.holds(Ordering::Equal));
        assert!(Cond::Le.holds(Ordering::Less));
        assert!(!Cond::Le.holds(Ordering::Greater));
        assert!(Cond::Ne.holds(Ordering::Less));
    }
}
