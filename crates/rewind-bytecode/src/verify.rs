//! Structural verification
//!
//! Checks that do not need type information: every label is defined once and
//! every jump target resolves, locals are within `max_locals`, exception
//! regions are well formed, the operand stack depth is consistent at every
//! join, and no path falls off the end of the body.

use crate::insn::{Insn, LabelId};
use crate::list::InsnId;
use crate::method::{ClassFile, CompiledMethod};
use rustc_hash::{FxHashMap, FxHashSet};

/// Bytecode verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// A label is placed more than once
    #[error("Label L{0} is defined more than once")]
    DuplicateLabel(u32),

    /// A jump or handler refers to a missing label
    #[error("Undefined label L{label} referenced at {at}")]
    UndefinedLabel {
        /// Missing label number
        label: u32,
        /// Where the reference appears
        at: String,
    },

    /// Stack underflow
    #[error("Stack underflow at {0}")]
    StackUnderflow(InsnId),

    /// Two paths reach an instruction with different stack depths
    #[error("Inconsistent stack depth at {at}: {expected} vs {found}")]
    StackDepthMismatch {
        /// Join instruction
        at: InsnId,
        /// Depth recorded first
        expected: usize,
        /// Depth of the later path
        found: usize,
    },

    /// Invalid local variable reference
    #[error("Invalid local variable reference: slot {slot} (max {max}) at {at}")]
    InvalidLocalRef {
        /// Referenced slot
        slot: u16,
        /// The method's `max_locals`
        max: u16,
        /// Referencing instruction
        at: InsnId,
    },

    /// Handler region ends before it starts
    #[error("Exception region L{start}..L{end} is empty or inverted")]
    InvalidHandlerRange {
        /// Start label number
        start: u32,
        /// End label number
        end: u32,
    },

    /// Execution falls off end
    #[error("Execution falls off end of method after {0}")]
    FallOffEnd(InsnId),

    /// Method has no instructions
    #[error("Method has no code")]
    EmptyMethod,

    /// Error located in a specific method
    #[error("{method}: {source}")]
    InMethod {
        /// Qualified method name
        method: String,
        /// Underlying error
        #[source]
        source: Box<VerifyError>,
    },
}

/// Verify every method of a class
///
/// Methods without code (abstract or native) are skipped.
pub fn verify_class(class: &ClassFile) -> Result<(), VerifyError> {
    for method in class.methods.iter().filter(|m| !m.code.is_empty()) {
        verify_method(method).map_err(|e| VerifyError::InMethod {
            method: format!("{}.{}", class.name, method.name),
            source: Box::new(e),
        })?;
    }
    Ok(())
}

/// Verify a single method, returning its maximum stack depth
pub fn verify_method(method: &CompiledMethod) -> Result<u16, VerifyError> {
    if method.code.is_empty() {
        return Err(VerifyError::EmptyMethod);
    }

    let labels = collect_labels(method)?;
    verify_targets(method, &labels)?;
    verify_local_refs(method)?;
    let positions = verify_handlers(method, &labels)?;
    verify_stack_depth(method, &labels, &positions)
}

/// Compute `max_stack` for a method, verifying it on the way
pub fn compute_max_stack(method: &CompiledMethod) -> Result<u16, VerifyError> {
    verify_method(method)
}

fn collect_labels(method: &CompiledMethod) -> Result<FxHashMap<LabelId, InsnId>, VerifyError> {
    let mut labels = FxHashMap::default();
    for (id, insn) in method.code.iter() {
        if let Insn::Label(label) = insn {
            if labels.insert(*label, id).is_some() {
                return Err(VerifyError::DuplicateLabel(label.0));
            }
        }
    }
    Ok(labels)
}

fn verify_targets(
    method: &CompiledMethod,
    labels: &FxHashMap<LabelId, InsnId>,
) -> Result<(), VerifyError> {
    for (id, insn) in method.code.iter() {
        for target in insn.targets() {
            if !labels.contains_key(&target) {
                return Err(VerifyError::UndefinedLabel {
                    label: target.0,
                    at: id.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn verify_local_refs(method: &CompiledMethod) -> Result<(), VerifyError> {
    for (id, insn) in method.code.iter() {
        if let Some((slot, kind)) = insn.local_access() {
            if slot + kind.slots() > method.max_locals {
                return Err(VerifyError::InvalidLocalRef {
                    slot,
                    max: method.max_locals,
                    at: id,
                });
            }
        }
    }
    Ok(())
}

/// Check handler labels and return the program position of every instruction
fn verify_handlers(
    method: &CompiledMethod,
    labels: &FxHashMap<LabelId, InsnId>,
) -> Result<FxHashMap<InsnId, usize>, VerifyError> {
    let positions: FxHashMap<InsnId, usize> =
        method.code.ids().into_iter().enumerate().map(|(i, id)| (id, i)).collect();

    for handler in &method.handlers {
        let resolve = |label: LabelId| {
            labels
                .get(&label)
                .copied()
                .ok_or_else(|| VerifyError::UndefinedLabel {
                    label: label.0,
                    at: "exception table".to_string(),
                })
        };
        let start = resolve(handler.start)?;
        let end = resolve(handler.end)?;
        resolve(handler.handler)?;
        if positions[&start] >= positions[&end] {
            return Err(VerifyError::InvalidHandlerRange {
                start: handler.start.0,
                end: handler.end.0,
            });
        }
    }
    Ok(positions)
}

fn verify_stack_depth(
    method: &CompiledMethod,
    labels: &FxHashMap<LabelId, InsnId>,
    positions: &FxHashMap<InsnId, usize>,
) -> Result<u16, VerifyError> {
    let code = &method.code;
    let mut depths: FxHashMap<InsnId, usize> = FxHashMap::default();
    let mut worklist: Vec<(InsnId, usize)> = Vec::new();
    let mut max_depth = 0usize;

    // Handler ranges as position intervals
    let ranges: Vec<(usize, usize, InsnId)> = method
        .handlers
        .iter()
        .map(|h| (positions[&labels[&h.start]], positions[&labels[&h.end]], labels[&h.handler]))
        .collect();
    let mut seeded_handlers: FxHashSet<InsnId> = FxHashSet::default();

    if let Some(first) = code.first() {
        worklist.push((first, 0));
    }

    while let Some((id, depth)) = worklist.pop() {
        match depths.get(&id) {
            Some(&known) if known == depth => continue,
            Some(&known) => {
                return Err(VerifyError::StackDepthMismatch {
                    at: id,
                    expected: known,
                    found: depth,
                })
            }
            None => {
                depths.insert(id, depth);
            }
        }

        let pos = positions[&id];
        for &(start, end, handler) in &ranges {
            if pos >= start && pos < end && seeded_handlers.insert(handler) {
                worklist.push((handler, 1));
            }
        }

        let insn = code.get(id);
        let (pops, pushes) = insn.stack_effect();
        if depth < pops {
            return Err(VerifyError::StackUnderflow(id));
        }
        let after = depth - pops + pushes;
        max_depth = max_depth.max(after).max(depth);

        for target in insn.targets() {
            worklist.push((labels[&target], after));
        }
        if !insn.is_terminator() {
            match code.next(id) {
                Some(next) => worklist.push((next, after)),
                None => return Err(VerifyError::FallOffEnd(id)),
            }
        }
    }

    Ok(max_depth.min(u16::MAX as usize) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MethodBuilder;
    use crate::types::{Signature, Type, ValueKind};

    #[test]
    fn test_verify_simple() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![Type::Int], Type::Int), true);
        b.load(ValueKind::Int, 0).iconst(1).add(ValueKind::Int).ret(Some(ValueKind::Int));
        let method = b.finish().unwrap();
        assert_eq!(method.max_stack, 2);
        assert_eq!(verify_method(&method), Ok(2));
    }

    #[test]
    fn test_falls_off_end() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![], Type::Void), true);
        b.iconst(1).pop();
        let method = b.finish_unchecked();
        assert!(matches!(verify_method(&method), Err(VerifyError::FallOffEnd(_))));
    }

    #[test]
    fn test_undefined_label() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![], Type::Void), true);
        b.jump(LabelId(99));
        let method = b.finish_unchecked();
        assert!(matches!(
            verify_method(&method),
            Err(VerifyError::UndefinedLabel { label: 99, .. })
        ));
    }

    #[test]
    fn test_depth_mismatch_at_join() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![Type::Int], Type::Void), true);
        let join = b.new_label();
        b.iconst(7)
            .load(ValueKind::Int, 0)
            .if_cond(crate::insn::Cond::Eq, join)
            .iconst(8)
            .label(join)
            .ret(None);
        let method = b.finish_unchecked();
        assert!(matches!(
            verify_method(&method),
            Err(VerifyError::StackDepthMismatch { .. })
        ));
    }

    #[test]
    fn test_local_out_of_range() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![Type::Int], Type::Void), true);
        b.load(ValueKind::Long, 0).pop().ret(None);
        let mut method = b.finish_unchecked();
        method.max_locals = 1;
        assert!(matches!(
            verify_method(&method),
            Err(VerifyError::InvalidLocalRef { slot: 0, .. })
        ));
    }
}
