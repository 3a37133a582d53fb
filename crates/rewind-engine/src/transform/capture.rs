//! Variable capture planning
//!
//! Every value that must survive a suspension point is passed to the
//! continuation as a parameter. The planner assigns those parameters once per
//! method so that a variable live at several suspension points uses one
//! parameter, not one per point.
//!
//! A slot is matched against the variables already planned in this order:
//! 1. a variable already used for another slot with the same origin at this
//!    point (aliases share a parameter)
//! 2. an unused variable with the same declared name and descriptor
//! 3. an unused variable with the same descriptor
//! 4. a new variable

use super::error::TransformErrorKind;
use super::frame::{AbstractFrame, FrameValue, Origin, Slot, ValueDescriptor};
use super::locate::SuspensionSite;
use rewind_bytecode::{CompiledMethod, InsnId, Type};
use rustc_hash::{FxHashMap, FxHashSet};

/// A value carried across suspension points as a continuation parameter
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedVariable {
    /// Slot where the value was first seen
    pub source: Slot,
    /// Parameter type
    pub ty: Type,
    /// Descriptor shared by every slot mapped to this variable
    pub desc: ValueDescriptor,
    /// Declared local name, when the slot had one
    pub name: Option<String>,
    /// Position among the captured parameters
    pub param_index: usize,
}

/// Captured-variable index for every slot of one frame
///
/// `None` marks a slot that is not carried: empty, null or undecided.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotMapping {
    /// Stack entries, bottom first, excluding the awaited future
    pub stack: Vec<Option<usize>>,
    /// Local slots
    pub locals: Vec<Option<usize>>,
}

/// The planned captured parameters of one method
#[derive(Debug, Clone, Default)]
pub struct CapturePlan {
    /// Captured variables in parameter order
    pub variables: Vec<CapturedVariable>,
    /// Mapping of the entry frame
    pub entry: SlotMapping,
}

impl CapturePlan {
    /// Local slot of each captured parameter in the continuation
    pub fn param_offsets(&self) -> Vec<u16> {
        let mut offset = 0u16;
        self.variables
            .iter()
            .map(|v| {
                let here = offset;
                offset += v.ty.slots();
                here
            })
            .collect()
    }

    /// Local slots taken by all captured parameters
    pub fn slot_count(&self) -> u16 {
        self.variables.iter().map(|v| v.ty.slots()).sum()
    }
}

/// Declared local names with their validity ranges in program positions
struct LocalNames {
    entries: Vec<(u16, String, usize, usize)>,
}

impl LocalNames {
    fn new(method: &CompiledMethod) -> Self {
        let positions: FxHashMap<InsnId, usize> = method
            .code
            .ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        let labels = method.code.label_index();
        let entries = method
            .local_vars
            .iter()
            .filter_map(|var| {
                let start = positions.get(labels.get(&var.start)?)?;
                let end = positions.get(labels.get(&var.end)?)?;
                Some((var.slot, var.name.clone(), *start, *end))
            })
            .collect();
        Self { entries }
    }

    fn name_at(&self, slot: u16, position: usize) -> Option<&str> {
        self.entries
            .iter()
            .find(|(s, _, start, end)| *s == slot && *start <= position && position < *end)
            .map(|(_, name, _, _)| name.as_str())
    }
}

struct Planner {
    names: LocalNames,
    variables: Vec<CapturedVariable>,
}

/// Per-frame matching state
#[derive(Default)]
struct FrameState {
    used: FxHashSet<usize>,
    by_origin: FxHashMap<Origin, usize>,
}

impl Planner {
    fn assign(
        &mut self,
        value: &FrameValue,
        slot: Slot,
        name: Option<&str>,
        state: &mut FrameState,
    ) -> Result<Option<usize>, TransformErrorKind> {
        if let ValueDescriptor::Uninitialized { class, .. } = &value.desc {
            return Err(TransformErrorKind::UninitializedCapture {
                class: class.clone(),
            });
        }
        let Some(ty) = value.desc.to_type() else {
            return Ok(None);
        };

        if let Some(&index) = state.by_origin.get(&value.origin) {
            if self.variables[index].desc == value.desc {
                return Ok(Some(index));
            }
        }

        let free = |v: &&CapturedVariable| !state.used.contains(&v.param_index) && v.desc == value.desc;
        let by_name = name.and_then(|name| {
            self.variables
                .iter()
                .filter(free)
                .find(|v| v.name.as_deref() == Some(name))
                .map(|v| v.param_index)
        });
        let index = match by_name.or_else(|| self.variables.iter().find(free).map(|v| v.param_index)) {
            Some(index) => index,
            None => {
                let index = self.variables.len();
                self.variables.push(CapturedVariable {
                    source: slot,
                    ty,
                    desc: value.desc.clone(),
                    name: name.map(str::to_string),
                    param_index: index,
                });
                index
            }
        };

        state.used.insert(index);
        state.by_origin.insert(value.origin.clone(), index);
        Ok(Some(index))
    }

    fn map_frame(
        &mut self,
        frame: &AbstractFrame,
        position: usize,
        resume_id: u32,
    ) -> Result<SlotMapping, TransformErrorKind> {
        let mut state = FrameState::default();
        let mut mapping = SlotMapping::default();

        for (i, local) in frame.locals.iter().enumerate() {
            let index = match local {
                Some(value) => {
                    let name = self.names.name_at(i as u16, position).map(str::to_string);
                    self.assign(value, Slot::Local(i as u16), name.as_deref(), &mut state)?
                }
                None => None,
            };
            mapping.locals.push(index);
        }

        // the awaited future on top travels separately
        let depth = frame.stack.len() - usize::from(resume_id != 0 && !frame.stack.is_empty());
        for (i, value) in frame.stack[..depth].iter().enumerate() {
            // rebuilding it as null would change what its consumer sees
            if value.desc == ValueDescriptor::Undecided {
                return Err(TransformErrorKind::UndecidedCapture {
                    resume_id,
                    slot: Slot::Stack(i).to_string(),
                });
            }
            let index = self.assign(value, Slot::Stack(i), None, &mut state)?;
            mapping.stack.push(index);
        }

        Ok(mapping)
    }
}

/// Plan the captured variables for the entry frame and every site
///
/// Attaches a mapping to each site.
pub fn plan_captures(
    method: &CompiledMethod,
    entry: &AbstractFrame,
    sites: &mut [SuspensionSite],
) -> Result<CapturePlan, TransformErrorKind> {
    let mut planner = Planner {
        names: LocalNames::new(method),
        variables: Vec::new(),
    };

    let entry_mapping = planner.map_frame(entry, 0, 0)?;
    for site in sites.iter_mut() {
        let mapping = planner.map_frame(&site.frame, site.position, site.resume_id)?;
        site.mapping = Some(mapping);
    }

    tracing::debug!(
        method = %method.name,
        captured = planner.variables.len(),
        sites = sites.len(),
        "planned captured variables"
    );

    Ok(CapturePlan {
        variables: planner.variables,
        entry: entry_mapping,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_bytecode::{InsnList, Insn, ValueKind};

    fn ids(n: usize) -> Vec<InsnId> {
        let mut list = InsnList::new();
        (0..n).map(|_| list.push(Insn::Nop)).collect()
    }

    fn value(desc: ValueDescriptor, origin: Origin) -> FrameValue {
        FrameValue::new(desc, origin)
    }

    fn long() -> ValueDescriptor {
        ValueDescriptor::Primitive(ValueKind::Long)
    }

    fn site(frame: AbstractFrame, resume_id: u32, insn: InsnId) -> SuspensionSite {
        SuspensionSite {
            insn,
            position: 0,
            resume_id,
            frame,
            line: None,
            mapping: None,
        }
    }

    fn future(origin: Origin) -> FrameValue {
        value(ValueDescriptor::Object("rewind.Future".into()), origin)
    }

    #[test]
    fn test_variables_are_shared_across_sites() {
        let at = ids(4);
        let entry = AbstractFrame {
            locals: vec![Some(value(long(), Origin::Param(0))), None],
            ..Default::default()
        };
        let first = AbstractFrame {
            stack: vec![future(Origin::Insn(at[0]))],
            locals: vec![Some(value(long(), Origin::Param(0))), None],
            monitors: vec![],
        };
        let second = AbstractFrame {
            stack: vec![
                value(ValueDescriptor::Primitive(ValueKind::Int), Origin::Insn(at[1])),
                future(Origin::Insn(at[2])),
            ],
            locals: vec![Some(value(long(), Origin::Insn(at[3]))), None],
            monitors: vec![],
        };
        let method = CompiledMethod::new(
            "f",
            rewind_bytecode::Signature::new(vec![rewind_bytecode::Type::Long], rewind_bytecode::Type::Void),
            true,
        );
        let mut sites = vec![site(first, 1, at[0]), site(second, 2, at[2])];
        let plan = plan_captures(&method, &entry, &mut sites).unwrap();

        assert_eq!(plan.variables.len(), 2);
        assert_eq!(plan.entry.locals, vec![Some(0), None]);
        let m1 = sites[0].mapping.as_ref().unwrap();
        assert_eq!(m1.locals, vec![Some(0), None]);
        assert!(m1.stack.is_empty());
        let m2 = sites[1].mapping.as_ref().unwrap();
        assert_eq!(m2.locals, vec![Some(0), None]);
        assert_eq!(m2.stack, vec![Some(1)]);
        assert_eq!(plan.param_offsets(), vec![0, 2]);
        assert_eq!(plan.slot_count(), 3);
    }

    #[test]
    fn test_aliases_share_a_variable() {
        let at = ids(2);
        let lock = value(ValueDescriptor::Object("a.Lock".into()), Origin::Insn(at[0]));
        let frame = AbstractFrame {
            stack: vec![lock.clone(), future(Origin::Insn(at[1]))],
            locals: vec![Some(lock.clone()), Some(lock.clone())],
            monitors: vec![lock],
        };
        let method = CompiledMethod::new(
            "f",
            rewind_bytecode::Signature::new(vec![], rewind_bytecode::Type::Void),
            true,
        );
        let mut sites = vec![site(frame, 1, at[1])];
        let plan = plan_captures(&method, &AbstractFrame::default(), &mut sites).unwrap();
        assert_eq!(plan.variables.len(), 1);
        let mapping = sites[0].mapping.as_ref().unwrap();
        assert_eq!(mapping.locals, vec![Some(0), Some(0)]);
        assert_eq!(mapping.stack, vec![Some(0)]);
    }

    #[test]
    fn test_null_and_undecided_are_not_captured() {
        let at = ids(3);
        let frame = AbstractFrame {
            stack: vec![future(Origin::Insn(at[0]))],
            locals: vec![
                Some(value(ValueDescriptor::Null, Origin::Insn(at[1]))),
                Some(value(ValueDescriptor::Undecided, Origin::Insn(at[2]))),
            ],
            monitors: vec![],
        };
        let method = CompiledMethod::new(
            "f",
            rewind_bytecode::Signature::new(vec![], rewind_bytecode::Type::Void),
            true,
        );
        let mut sites = vec![site(frame, 1, at[0])];
        let plan = plan_captures(&method, &AbstractFrame::default(), &mut sites).unwrap();
        assert!(plan.variables.is_empty());
        assert_eq!(sites[0].mapping.as_ref().unwrap().locals, vec![None, None]);
    }

    #[test]
    fn test_uninitialized_is_rejected() {
        let at = ids(2);
        let frame = AbstractFrame {
            stack: vec![
                value(
                    ValueDescriptor::Uninitialized { site: at[0], class: "a.Box".into() },
                    Origin::Insn(at[0]),
                ),
                future(Origin::Insn(at[1])),
            ],
            ..Default::default()
        };
        let method = CompiledMethod::new(
            "f",
            rewind_bytecode::Signature::new(vec![], rewind_bytecode::Type::Void),
            true,
        );
        let mut sites = vec![site(frame, 1, at[1])];
        assert_eq!(
            plan_captures(&method, &AbstractFrame::default(), &mut sites).unwrap_err(),
            TransformErrorKind::UninitializedCapture { class: "a.Box".into() }
        );
    }

    #[test]
    fn test_undecided_stack_value_is_rejected() {
        let at = ids(2);
        let frame = AbstractFrame {
            stack: vec![
                value(ValueDescriptor::Undecided, Origin::Merge { at: at[0], slot: Slot::Stack(0) }),
                future(Origin::Insn(at[1])),
            ],
            ..Default::default()
        };
        let method = CompiledMethod::new(
            "f",
            rewind_bytecode::Signature::new(vec![], rewind_bytecode::Type::Void),
            true,
        );
        let mut sites = vec![site(frame, 1, at[1])];
        assert_eq!(
            plan_captures(&method, &AbstractFrame::default(), &mut sites).unwrap_err(),
            TransformErrorKind::UndecidedCapture {
                resume_id: 1,
                slot: "stack[0]".into()
            }
        );
    }

    #[test]
    fn test_names_take_priority() {
        use rewind_bytecode::{MethodBuilder, Signature, Type};

        // two int locals, declared as "count" (slot 0) and "total" (slot 1)
        let mut b = MethodBuilder::new("f", Signature::new(vec![], Type::Void), true);
        let (start, end) = (b.new_label(), b.new_label());
        b.label(start).iconst(0).store(ValueKind::Int, 0).iconst(0).store(ValueKind::Int, 1);
        b.label(end).ret(None);
        b.local_var("count", 0, Type::Int, start, end);
        b.local_var("total", 1, Type::Int, start, end);
        let method = b.finish().unwrap();

        let at = ids(5);
        let int = |o| value(ValueDescriptor::Primitive(ValueKind::Int), o);
        let first = AbstractFrame {
            stack: vec![future(Origin::Insn(at[0]))],
            locals: vec![Some(int(Origin::Insn(at[1]))), Some(int(Origin::Insn(at[2])))],
            monitors: vec![],
        };
        // "total" only, now in slot 1 with "count" gone
        let second = AbstractFrame {
            stack: vec![future(Origin::Insn(at[3]))],
            locals: vec![None, Some(int(Origin::Insn(at[4])))],
            monitors: vec![],
        };
        let mut sites = vec![site(first, 1, at[0]), site(second, 2, at[3])];
        sites[0].position = 2;
        sites[1].position = 3;
        let plan = plan_captures(&method, &AbstractFrame::default(), &mut sites).unwrap();
        assert_eq!(plan.variables.len(), 2);
        assert_eq!(plan.variables[1].name.as_deref(), Some("total"));
        assert_eq!(sites[1].mapping.as_ref().unwrap().locals, vec![None, Some(1)]);
    }
}
