//! Abstract frames
//!
//! A frame describes the operand stack, the local slots and the held
//! monitors before one instruction executes. Every value carries a
//! [`ValueDescriptor`] (what it is) and an [`Origin`] (where it came from).
//! Origins give values an identity: a `Dup`, `Load` or `Store` copies the
//! origin along with the descriptor, which is how a monitor release is
//! matched to its acquisition and how aliased slots are recognized.

use super::error::AnalysisError;
use rewind_bytecode::names::{OBJECT_CLASS, STRING_CLASS};
use rewind_bytecode::{CompiledMethod, Constant, InsnId, Type, ValueKind};
use rustc_hash::FxHashMap;
use std::fmt;

/// What a stack entry or local slot holds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueDescriptor {
    /// Non-reference value of the given kind
    Primitive(ValueKind),
    /// Initialized reference of the named class
    Object(String),
    /// Allocated at `site` but not yet constructed
    Uninitialized {
        /// The `New` instruction
        site: InsnId,
        /// Allocated class
        class: String,
    },
    /// The null constant
    Null,
    /// Paths disagree; must be redefined before it is read
    Undecided,
}

impl ValueDescriptor {
    /// Descriptor of a declared type (`None` for `Void`)
    pub fn from_type(ty: &Type) -> Option<Self> {
        match ty {
            Type::Void => None,
            Type::Object(class) => Some(ValueDescriptor::Object(class.clone())),
            other => other.kind().map(ValueDescriptor::Primitive),
        }
    }

    /// Descriptor of a pushed constant
    pub fn from_constant(c: &Constant) -> Self {
        match c {
            Constant::Null => ValueDescriptor::Null,
            Constant::Str(_) => ValueDescriptor::Object(STRING_CLASS.to_string()),
            other => ValueDescriptor::Primitive(other.kind()),
        }
    }

    /// Computational kind; `None` when undecided
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            ValueDescriptor::Primitive(kind) => Some(*kind),
            ValueDescriptor::Object(_)
            | ValueDescriptor::Uninitialized { .. }
            | ValueDescriptor::Null => Some(ValueKind::Ref),
            ValueDescriptor::Undecided => None,
        }
    }

    /// Whether the value takes two local slots
    pub fn is_wide(&self) -> bool {
        self.kind().is_some_and(ValueKind::is_wide)
    }

    /// Whether the value must be carried across a suspension point
    ///
    /// Null and undecided values are rebuilt instead.
    pub fn is_capturable(&self) -> bool {
        matches!(
            self,
            ValueDescriptor::Primitive(_)
                | ValueDescriptor::Object(_)
                | ValueDescriptor::Uninitialized { .. }
        )
    }

    /// Whether this is an unconstructed object
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, ValueDescriptor::Uninitialized { .. })
    }

    /// Declared type for a parameter carrying this value
    pub fn to_type(&self) -> Option<Type> {
        match self {
            ValueDescriptor::Primitive(ValueKind::Int) => Some(Type::Int),
            ValueDescriptor::Primitive(ValueKind::Long) => Some(Type::Long),
            ValueDescriptor::Primitive(ValueKind::Float) => Some(Type::Float),
            ValueDescriptor::Primitive(ValueKind::Double) => Some(Type::Double),
            ValueDescriptor::Primitive(ValueKind::Ref) => Some(Type::object(OBJECT_CLASS)),
            ValueDescriptor::Object(class) => Some(Type::object(class.clone())),
            ValueDescriptor::Uninitialized { .. }
            | ValueDescriptor::Null
            | ValueDescriptor::Undecided => None,
        }
    }

    /// Unify two descriptors at a join
    pub fn merge(&self, other: &Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (ValueDescriptor::Null, ValueDescriptor::Object(c))
            | (ValueDescriptor::Object(c), ValueDescriptor::Null) => {
                ValueDescriptor::Object(c.clone())
            }
            _ => ValueDescriptor::Undecided,
        }
    }
}

impl fmt::Display for ValueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueDescriptor::Primitive(kind) => {
                write!(f, "{}", format!("{:?}", kind).to_lowercase())
            }
            ValueDescriptor::Object(class) => write!(f, "{}", class),
            ValueDescriptor::Uninitialized { site, class } => {
                write!(f, "uninit {}@{}", class, site)
            }
            ValueDescriptor::Null => write!(f, "null"),
            ValueDescriptor::Undecided => write!(f, "?"),
        }
    }
}

/// Position of a value within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Operand stack entry, bottom is 0
    Stack(usize),
    /// Local variable slot
    Local(u16),
    /// Entry in the held-monitor list
    Monitor(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Stack(i) => write!(f, "stack[{}]", i),
            Slot::Local(i) => write!(f, "local[{}]", i),
            Slot::Monitor(i) => write!(f, "monitor[{}]", i),
        }
    }
}

/// Provenance of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Receiver or parameter in the given local slot
    Param(u16),
    /// Produced by an instruction
    Insn(InsnId),
    /// Distinct values joined at an instruction
    Merge {
        /// Join instruction
        at: InsnId,
        /// Slot where the paths met
        slot: Slot,
    },
    /// Imposed by a frame assertion
    Asserted {
        /// The `Frame` instruction
        at: InsnId,
        /// Asserted slot
        slot: Slot,
    },
    /// Exception delivered to a handler
    Handler(InsnId),
}

/// A described value with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameValue {
    /// What the value is
    pub desc: ValueDescriptor,
    /// Where it came from
    pub origin: Origin,
}

impl FrameValue {
    /// Create a value
    pub fn new(desc: ValueDescriptor, origin: Origin) -> Self {
        Self { desc, origin }
    }
}

/// Reconstructed machine state before an instruction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbstractFrame {
    /// Operand stack, top last
    pub stack: Vec<FrameValue>,
    /// Local slots; a wide value is followed by `None`
    pub locals: Vec<Option<FrameValue>>,
    /// Held monitors, most recent last
    pub monitors: Vec<FrameValue>,
}

impl AbstractFrame {
    /// Frame at method entry: receiver and parameters, nothing else
    pub fn entry(owner: &str, method: &CompiledMethod) -> Self {
        let mut locals = vec![None; usize::from(method.max_locals.max(method.param_slots()))];
        let mut slot = 0u16;
        if !method.is_static {
            locals[0] = Some(FrameValue::new(
                ValueDescriptor::Object(owner.to_string()),
                Origin::Param(0),
            ));
            slot = 1;
        }
        for param in &method.sig.params {
            if let Some(desc) = ValueDescriptor::from_type(param) {
                locals[usize::from(slot)] = Some(FrameValue::new(desc, Origin::Param(slot)));
            }
            slot += param.slots();
        }
        Self {
            stack: Vec::new(),
            locals,
            monitors: Vec::new(),
        }
    }

    /// Push a value
    pub fn push(&mut self, value: FrameValue) {
        self.stack.push(value);
    }

    /// Pop a value
    pub fn pop(&mut self, at: InsnId) -> Result<FrameValue, AnalysisError> {
        self.stack.pop().ok_or(AnalysisError::StackUnderflow { at })
    }

    /// Pop `n` values, returned bottom first
    pub fn pop_n(&mut self, n: usize, at: InsnId) -> Result<Vec<FrameValue>, AnalysisError> {
        if self.stack.len() < n {
            return Err(AnalysisError::StackUnderflow { at });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    /// Pop a value the instruction reads
    pub fn pop_read(&mut self, at: InsnId) -> Result<FrameValue, AnalysisError> {
        let value = self.pop(at)?;
        if value.desc == ValueDescriptor::Undecided {
            return Err(AnalysisError::UndecidedOperand { at });
        }
        Ok(value)
    }

    /// Pop `n` values the instruction reads, returned bottom first
    pub fn pop_n_read(&mut self, n: usize, at: InsnId) -> Result<Vec<FrameValue>, AnalysisError> {
        let values = self.pop_n(n, at)?;
        if values.iter().any(|v| v.desc == ValueDescriptor::Undecided) {
            return Err(AnalysisError::UndecidedOperand { at });
        }
        Ok(values)
    }

    /// Top of stack
    pub fn peek(&self, at: InsnId) -> Result<&FrameValue, AnalysisError> {
        self.stack.last().ok_or(AnalysisError::StackUnderflow { at })
    }

    /// Read a local of the given kind
    pub fn load(&self, slot: u16, kind: ValueKind, at: InsnId) -> Result<FrameValue, AnalysisError> {
        self.check_range(slot, kind, at)?;
        match &self.locals[usize::from(slot)] {
            Some(value) if value.desc.kind() == Some(kind) => Ok(value.clone()),
            _ => Err(AnalysisError::UnreadableLocal { at, slot }),
        }
    }

    /// Write a local, clearing any wide value it overlaps
    pub fn store(
        &mut self,
        slot: u16,
        kind: ValueKind,
        value: FrameValue,
        at: InsnId,
    ) -> Result<(), AnalysisError> {
        self.check_range(slot, kind, at)?;
        let i = usize::from(slot);
        if i > 0 && self.locals[i - 1].as_ref().is_some_and(|v| v.desc.is_wide()) {
            self.locals[i - 1] = None;
        }
        self.locals[i] = Some(value);
        if kind.is_wide() {
            self.locals[i + 1] = None;
        }
        Ok(())
    }

    fn check_range(&self, slot: u16, kind: ValueKind, at: InsnId) -> Result<(), AnalysisError> {
        if usize::from(slot) + usize::from(kind.slots()) > self.locals.len() {
            return Err(AnalysisError::LocalOutOfRange { at, slot });
        }
        Ok(())
    }

    /// Replace every occurrence of descriptor `from` with `to`
    pub fn replace_desc(&mut self, from: &ValueDescriptor, to: &ValueDescriptor) {
        for value in self
            .stack
            .iter_mut()
            .chain(self.locals.iter_mut().flatten())
            .chain(self.monitors.iter_mut())
        {
            if &value.desc == from {
                value.desc = to.clone();
            }
        }
    }

    /// Allocation sites of every unconstructed object in the frame
    pub fn uninitialized_sites(&self) -> Vec<InsnId> {
        let mut sites: Vec<InsnId> = self
            .stack
            .iter()
            .chain(self.locals.iter().flatten())
            .filter_map(|v| match &v.desc {
                ValueDescriptor::Uninitialized { site, .. } => Some(*site),
                _ => None,
            })
            .collect();
        sites.sort();
        sites.dedup();
        sites
    }

    /// Whether any slot holds an unconstructed object
    pub fn has_uninitialized(&self) -> bool {
        self.stack
            .iter()
            .chain(self.locals.iter().flatten())
            .any(|v| v.desc.is_uninitialized())
    }

    /// Lowest local slot holding a value with this origin
    pub fn local_holding(&self, origin: &Origin) -> Option<u16> {
        self.locals
            .iter()
            .position(|v| v.as_ref().is_some_and(|v| &v.origin == origin))
            .map(|i| i as u16)
    }

    /// Join two frames reaching `at`
    ///
    /// Slots whose origins disagree get a fresh merge origin. Slots that
    /// shared an origin on both incoming paths still share one afterwards,
    /// so aliases (a monitor and the local that holds it) stay matched.
    pub fn merge(&self, other: &AbstractFrame, at: InsnId) -> Result<AbstractFrame, AnalysisError> {
        if self.stack.len() != other.stack.len() {
            return Err(AnalysisError::StackMismatch {
                at,
                expected: self.stack.len(),
                found: other.stack.len(),
            });
        }
        if self.monitors.len() != other.monitors.len() {
            return Err(AnalysisError::MonitorMismatch {
                at,
                expected: self.monitors.len(),
                found: other.monitors.len(),
            });
        }

        let mut merger = OriginMerger::new(at);
        let locals = merge_locals(&self.locals, &other.locals, &mut merger);
        let stack = self
            .stack
            .iter()
            .zip(&other.stack)
            .enumerate()
            .map(|(i, (a, b))| merger.value(a, b, Slot::Stack(i)))
            .collect();
        let monitors = self
            .monitors
            .iter()
            .zip(&other.monitors)
            .enumerate()
            .map(|(i, (a, b))| merger.value(a, b, Slot::Monitor(i)))
            .collect();

        Ok(AbstractFrame {
            stack,
            locals,
            monitors,
        })
    }

    /// Locals as seen by an exception handler covering an instruction
    ///
    /// The instruction may or may not have completed, so the locals before
    /// and after it are joined.
    pub fn handler_locals(
        before: &AbstractFrame,
        after: &AbstractFrame,
        at: InsnId,
    ) -> Vec<Option<FrameValue>> {
        let mut merger = OriginMerger::new(at);
        merge_locals(&before.locals, &after.locals, &mut merger)
    }
}

fn merge_locals(
    a: &[Option<FrameValue>],
    b: &[Option<FrameValue>],
    merger: &mut OriginMerger,
) -> Vec<Option<FrameValue>> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| match (a.get(i).cloned().flatten(), b.get(i).cloned().flatten()) {
            (Some(x), Some(y)) => Some(merger.value(&x, &y, Slot::Local(i as u16))),
            _ => None,
        })
        .collect()
}

/// Assigns merge origins, reusing one per distinct pair of incoming origins
struct OriginMerger {
    at: InsnId,
    pairs: FxHashMap<(Origin, Origin), Origin>,
}

impl OriginMerger {
    fn new(at: InsnId) -> Self {
        Self {
            at,
            pairs: FxHashMap::default(),
        }
    }

    fn value(&mut self, a: &FrameValue, b: &FrameValue, slot: Slot) -> FrameValue {
        let desc = a.desc.merge(&b.desc);
        let origin = if a.origin == b.origin {
            a.origin.clone()
        } else {
            let at = self.at;
            self.pairs
                .entry((a.origin.clone(), b.origin.clone()))
                .or_insert(Origin::Merge { at, slot })
                .clone()
        };
        FrameValue::new(desc, origin)
    }
}

impl fmt::Display for AbstractFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locals=[")?;
        for (i, local) in self.locals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match local {
                Some(value) => write!(f, "{}", value.desc)?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "] stack=[")?;
        for (i, value) in self.stack.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value.desc)?;
        }
        write!(f, "]")?;
        if !self.monitors.is_empty() {
            write!(f, " monitors={}", self.monitors.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_bytecode::{InsnList, Insn, Signature};

    fn ids(n: usize) -> Vec<InsnId> {
        let mut list = InsnList::new();
        (0..n).map(|_| list.push(Insn::Nop)).collect()
    }

    fn obj(class: &str, origin: Origin) -> FrameValue {
        FrameValue::new(ValueDescriptor::Object(class.to_string()), origin)
    }

    #[test]
    fn test_descriptor_merge() {
        let a = ValueDescriptor::Object("a.A".into());
        let b = ValueDescriptor::Object("b.B".into());
        let int = ValueDescriptor::Primitive(ValueKind::Int);
        assert_eq!(a.merge(&a), a);
        assert_eq!(a.merge(&ValueDescriptor::Null), a);
        assert_eq!(ValueDescriptor::Null.merge(&a), a);
        assert_eq!(a.merge(&b), ValueDescriptor::Undecided);
        assert_eq!(int.merge(&ValueDescriptor::Null), ValueDescriptor::Undecided);
    }

    #[test]
    fn test_uninitialized_equality_is_by_site() {
        let at = ids(2);
        let x = ValueDescriptor::Uninitialized { site: at[0], class: "a.A".into() };
        let y = ValueDescriptor::Uninitialized { site: at[1], class: "a.A".into() };
        assert_ne!(x, y);
        assert_eq!(x.merge(&y), ValueDescriptor::Undecided);
        assert_eq!(x.merge(&x.clone()), x);
    }

    #[test]
    fn test_entry_frame_wide_params() {
        let method = CompiledMethod::new(
            "f",
            Signature::new(vec![Type::Long, Type::Int], Type::Void),
            false,
        );
        let frame = AbstractFrame::entry("a.A", &method);
        assert_eq!(frame.locals.len(), 4);
        assert_eq!(frame.locals[0].as_ref().unwrap().desc, ValueDescriptor::Object("a.A".into()));
        assert_eq!(
            frame.locals[1].as_ref().unwrap().desc,
            ValueDescriptor::Primitive(ValueKind::Long)
        );
        assert!(frame.locals[2].is_none());
        assert_eq!(frame.locals[3].as_ref().unwrap().origin, Origin::Param(3));
    }

    #[test]
    fn test_store_clears_overlapping_wide() {
        let at = ids(1)[0];
        let mut frame = AbstractFrame {
            locals: vec![None; 3],
            ..Default::default()
        };
        let long = FrameValue::new(ValueDescriptor::Primitive(ValueKind::Long), Origin::Insn(at));
        let int = FrameValue::new(ValueDescriptor::Primitive(ValueKind::Int), Origin::Insn(at));
        frame.store(0, ValueKind::Long, long, at).unwrap();
        frame.store(1, ValueKind::Int, int, at).unwrap();
        assert!(frame.locals[0].is_none());
        assert!(frame.load(0, ValueKind::Long, at).is_err());
        assert!(frame.load(1, ValueKind::Int, at).is_ok());
    }

    #[test]
    fn test_merge_keeps_aliases_together() {
        let at = ids(3);
        let lock_a = obj("a.Lock", Origin::Insn(at[0]));
        let lock_b = obj("a.Lock", Origin::Insn(at[1]));
        let a = AbstractFrame {
            stack: vec![],
            locals: vec![Some(lock_a.clone())],
            monitors: vec![lock_a],
        };
        let b = AbstractFrame {
            stack: vec![],
            locals: vec![Some(lock_b.clone())],
            monitors: vec![lock_b],
        };
        let merged = a.merge(&b, at[2]).unwrap();
        let local = merged.locals[0].as_ref().unwrap();
        assert_eq!(local.origin, merged.monitors[0].origin);
        assert_eq!(merged.local_holding(&merged.monitors[0].origin), Some(0));
    }

    #[test]
    fn test_merge_rejects_height_mismatch() {
        let at = ids(1)[0];
        let a = AbstractFrame {
            stack: vec![obj("x", Origin::Insn(at))],
            ..Default::default()
        };
        let b = AbstractFrame::default();
        assert!(matches!(
            a.merge(&b, at),
            Err(AnalysisError::StackMismatch { expected: 1, found: 0, .. })
        ));
    }

    #[test]
    fn test_merge_is_stable() {
        let at = ids(3);
        let a = AbstractFrame {
            stack: vec![obj("x", Origin::Insn(at[0]))],
            ..Default::default()
        };
        let b = AbstractFrame {
            stack: vec![obj("x", Origin::Insn(at[1]))],
            ..Default::default()
        };
        let once = a.merge(&b, at[2]).unwrap();
        let twice = once.merge(&b, at[2]).unwrap();
        assert_eq!(once, twice);
    }
}
