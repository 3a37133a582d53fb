//! Frame analyzer
//!
//! Forward data-flow analysis over a compiled method. Starting from the entry
//! frame it propagates frames along fall-through, branch, switch and
//! exception edges, joining them where paths meet, until nothing changes.
//!
//! Beyond a plain stack-machine analysis it tracks:
//! - held monitors, released by identity rather than strictly last-in
//!   first-out
//! - unconstructed objects, which become initialized everywhere in the frame
//!   once their constructor runs
//! - frame assertions, which replace the reconstructed frame outright

use super::error::AnalysisError;
use super::frame::{AbstractFrame, FrameValue, Origin, Slot, ValueDescriptor};
use rewind_bytecode::names::{CLOSURE_CLASS, OBJECT_CLASS};
use rewind_bytecode::{
    CompiledMethod, FrameAssertion, FrameType, Insn, InsnId, InvokeKind, LabelId, Type, ValueKind,
};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Reconstructed frames of one method
#[derive(Debug, Clone)]
pub struct Frames {
    order: Vec<InsnId>,
    positions: FxHashMap<InsnId, usize>,
    frames: Vec<Option<AbstractFrame>>,
    max_stack: usize,
}

impl Frames {
    /// Frame before `id`, `None` when unreachable
    pub fn at(&self, id: InsnId) -> Option<&AbstractFrame> {
        self.positions
            .get(&id)
            .and_then(|&pos| self.frames[pos].as_ref())
    }

    /// Frame at a program position
    pub fn at_position(&self, pos: usize) -> Option<&AbstractFrame> {
        self.frames.get(pos).and_then(Option::as_ref)
    }

    /// Program position of `id`
    pub fn position(&self, id: InsnId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Instructions in program order
    pub fn order(&self) -> &[InsnId] {
        &self.order
    }

    /// Whether `id` can execute
    pub fn is_reachable(&self, id: InsnId) -> bool {
        self.at(id).is_some()
    }

    /// Maximum operand stack depth over all reachable instructions
    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// Iterate `(id, frame)` over reachable instructions in program order
    pub fn iter(&self) -> impl Iterator<Item = (InsnId, &AbstractFrame)> + '_ {
        self.order
            .iter()
            .zip(&self.frames)
            .filter_map(|(id, frame)| frame.as_ref().map(|f| (*id, f)))
    }
}

struct HandlerRange {
    start: usize,
    end: usize,
    handler: usize,
    catch_type: String,
    catch_all: bool,
}

/// Analyze `method` declared in `owner`
pub fn analyze(
    owner: &str,
    method: &CompiledMethod,
    budget: usize,
) -> Result<Frames, AnalysisError> {
    Analyzer::new(owner, method)?.run(budget)
}

struct Analyzer<'a> {
    owner: &'a str,
    method: &'a CompiledMethod,
    order: Vec<InsnId>,
    positions: FxHashMap<InsnId, usize>,
    labels: FxHashMap<LabelId, usize>,
    handlers: Vec<HandlerRange>,
}

impl<'a> Analyzer<'a> {
    fn new(owner: &'a str, method: &'a CompiledMethod) -> Result<Self, AnalysisError> {
        let order = method.code.ids();
        let positions: FxHashMap<InsnId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let labels: FxHashMap<LabelId, usize> = method
            .code
            .label_index()
            .into_iter()
            .map(|(label, id)| (label, positions[&id]))
            .collect();

        let resolve = |label: LabelId| {
            labels
                .get(&label)
                .copied()
                .ok_or(AnalysisError::UnknownLabel(label.0))
        };
        let mut handlers = Vec::with_capacity(method.handlers.len());
        for h in &method.handlers {
            handlers.push(HandlerRange {
                start: resolve(h.start)?,
                end: resolve(h.end)?,
                handler: resolve(h.handler)?,
                catch_type: h.catch_type.clone().unwrap_or_else(|| OBJECT_CLASS.to_string()),
                catch_all: h.catch_type.is_none(),
            });
        }

        Ok(Self {
            owner,
            method,
            order,
            positions,
            labels,
            handlers,
        })
    }

    fn label(&self, label: LabelId) -> Result<usize, AnalysisError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(AnalysisError::UnknownLabel(label.0))
    }

    fn run(self, budget: usize) -> Result<Frames, AnalysisError> {
        let n = self.order.len();
        let mut frames: Vec<Option<AbstractFrame>> = vec![None; n];
        let mut queued = vec![false; n];
        let mut worklist = VecDeque::new();
        let mut max_stack = 0usize;
        let mut visits = 0usize;

        if n > 0 {
            frames[0] = Some(self.arrive(0, AbstractFrame::entry(self.owner, self.method))?);
            worklist.push_back(0);
            queued[0] = true;
        }

        while let Some(pos) = worklist.pop_front() {
            queued[pos] = false;
            visits += 1;
            if visits > budget {
                return Err(AnalysisError::NotConverged { visits: visits - 1 });
            }

            let id = self.order[pos];
            let insn = self.method.code.get(id);
            let before = match &frames[pos] {
                Some(frame) => frame.clone(),
                None => continue,
            };
            let after = self.execute(&before, id, insn)?;
            max_stack = max_stack.max(before.stack.len()).max(after.stack.len());

            let mut edges: Vec<(usize, AbstractFrame)> = Vec::new();
            for target in self.successors(pos, id, insn)? {
                edges.push((target, after.clone()));
            }
            if !insn.is_pseudo() {
                for (handler, frame) in self.exception_edges(pos, id, &before, &after) {
                    edges.push((handler, frame));
                }
            }

            for (target, incoming) in edges {
                let incoming = self.arrive(target, incoming)?;
                let at = self.order[target];
                let changed = match &frames[target] {
                    None => {
                        frames[target] = Some(incoming);
                        true
                    }
                    Some(existing) => {
                        let merged = existing.merge(&incoming, at)?;
                        if &merged != existing {
                            frames[target] = Some(merged);
                            true
                        } else {
                            false
                        }
                    }
                };
                if changed && !queued[target] {
                    queued[target] = true;
                    worklist.push_back(target);
                }
            }
        }

        tracing::trace!(
            owner = self.owner,
            method = %self.method.name,
            visits,
            "frame analysis converged"
        );

        Ok(Frames {
            order: self.order,
            positions: self.positions,
            frames,
            max_stack,
        })
    }

    /// Apply a frame assertion placed at `pos`, if there is one
    fn arrive(&self, pos: usize, frame: AbstractFrame) -> Result<AbstractFrame, AnalysisError> {
        let id = self.order[pos];
        match self.method.code.get(id) {
            Insn::Frame(assertion) => self.force(id, assertion, frame),
            _ => Ok(frame),
        }
    }

    fn force(
        &self,
        at: InsnId,
        assertion: &FrameAssertion,
        incoming: AbstractFrame,
    ) -> Result<AbstractFrame, AnalysisError> {
        let keep = |desc: ValueDescriptor, slot: Slot, old: Option<&FrameValue>| match old {
            Some(old) if old.desc == desc => FrameValue::new(desc, old.origin.clone()),
            _ => FrameValue::new(desc, Origin::Asserted { at, slot }),
        };

        let mut locals = vec![None; incoming.locals.len().max(assertion.locals.len())];
        for (i, ty) in assertion.locals.iter().enumerate() {
            if let Some(desc) = self.frame_type(ty)? {
                let old = incoming.locals.get(i).and_then(Option::as_ref);
                locals[i] = Some(keep(desc, Slot::Local(i as u16), old));
            }
        }

        let mut stack = Vec::with_capacity(assertion.stack.len());
        for (i, ty) in assertion.stack.iter().enumerate() {
            let desc = self.frame_type(ty)?.unwrap_or(ValueDescriptor::Undecided);
            stack.push(keep(desc, Slot::Stack(i), incoming.stack.get(i)));
        }

        Ok(AbstractFrame {
            stack,
            locals,
            monitors: incoming.monitors,
        })
    }

    fn frame_type(&self, ty: &FrameType) -> Result<Option<ValueDescriptor>, AnalysisError> {
        Ok(match ty {
            FrameType::Top => None,
            FrameType::Int => Some(ValueDescriptor::Primitive(ValueKind::Int)),
            FrameType::Long => Some(ValueDescriptor::Primitive(ValueKind::Long)),
            FrameType::Float => Some(ValueDescriptor::Primitive(ValueKind::Float)),
            FrameType::Double => Some(ValueDescriptor::Primitive(ValueKind::Double)),
            FrameType::Null => Some(ValueDescriptor::Null),
            FrameType::Object(class) => Some(ValueDescriptor::Object(class.clone())),
            FrameType::Uninitialized(label) => {
                // The label marks the allocation: the first `New` after it
                let start = self.label(*label)?;
                let site = self.order[start..]
                    .iter()
                    .find_map(|id| match self.method.code.get(*id) {
                        Insn::New(class) => Some((*id, class.clone())),
                        _ => None,
                    })
                    .ok_or(AnalysisError::UnknownLabel(label.0))?;
                Some(ValueDescriptor::Uninitialized {
                    site: site.0,
                    class: site.1,
                })
            }
        })
    }

    fn successors(&self, pos: usize, id: InsnId, insn: &Insn) -> Result<Vec<usize>, AnalysisError> {
        let mut out = Vec::new();
        for target in insn.targets() {
            out.push(self.label(target)?);
        }
        if !insn.is_terminator() {
            if pos + 1 >= self.order.len() {
                return Err(AnalysisError::FallsOffEnd { at: id });
            }
            out.push(pos + 1);
        }
        Ok(out)
    }

    /// Edges into the handlers covering `pos`, innermost first
    fn exception_edges(
        &self,
        pos: usize,
        id: InsnId,
        before: &AbstractFrame,
        after: &AbstractFrame,
    ) -> Vec<(usize, AbstractFrame)> {
        let mut out = Vec::new();
        for h in &self.handlers {
            if pos < h.start || pos >= h.end {
                continue;
            }
            let handler_id = self.order[h.handler];
            out.push((
                h.handler,
                AbstractFrame {
                    stack: vec![FrameValue::new(
                        ValueDescriptor::Object(h.catch_type.clone()),
                        Origin::Handler(handler_id),
                    )],
                    locals: AbstractFrame::handler_locals(before, after, id),
                    monitors: before.monitors.clone(),
                },
            ));
            if h.catch_all {
                break;
            }
        }
        out
    }

    fn execute(&self, before: &AbstractFrame, id: InsnId, insn: &Insn) -> Result<AbstractFrame, AnalysisError> {
        let mut frame = before.clone();
        let produced = |desc: ValueDescriptor| FrameValue::new(desc, Origin::Insn(id));

        match insn {
            Insn::Nop | Insn::Label(_) | Insn::Line(_) | Insn::Frame(_) | Insn::Jump(_) => {}

            Insn::Const(c) => frame.push(produced(ValueDescriptor::from_constant(c))),
            Insn::Pop => {
                frame.pop(id)?;
            }
            Insn::Dup => {
                let top = frame.peek(id)?.clone();
                frame.push(top);
            }
            Insn::DupX1 => {
                let a = frame.pop(id)?;
                let b = frame.pop(id)?;
                frame.push(a.clone());
                frame.push(b);
                frame.push(a);
            }
            Insn::Swap => {
                let a = frame.pop(id)?;
                let b = frame.pop(id)?;
                frame.push(a);
                frame.push(b);
            }

            Insn::Load { kind, slot } => {
                let value = frame.load(*slot, *kind, id)?;
                frame.push(value);
            }
            Insn::Store { kind, slot } => {
                let value = frame.pop(id)?;
                if value.desc.kind().is_some_and(|k| k != *kind) {
                    return Err(AnalysisError::BadOperand {
                        at: id,
                        expected: "a value of the stored kind",
                    });
                }
                frame.store(*slot, *kind, value, id)?;
            }

            Insn::Arith { kind, .. } => {
                frame.pop_n_read(2, id)?;
                frame.push(produced(ValueDescriptor::Primitive(*kind)));
            }
            Insn::Neg(kind) => {
                frame.pop_read(id)?;
                frame.push(produced(ValueDescriptor::Primitive(*kind)));
            }
            Insn::Convert { to, .. } => {
                frame.pop_read(id)?;
                frame.push(produced(ValueDescriptor::Primitive(*to)));
            }
            Insn::Compare(_) => {
                frame.pop_n_read(2, id)?;
                frame.push(produced(ValueDescriptor::Primitive(ValueKind::Int)));
            }

            Insn::If { .. } | Insn::IfNull(_) | Insn::IfNonNull(_) | Insn::Switch { .. } => {
                frame.pop_read(id)?;
            }
            Insn::IfCmp { .. } => {
                frame.pop_n_read(2, id)?;
            }

            Insn::New(class) => frame.push(produced(ValueDescriptor::Uninitialized {
                site: id,
                class: class.clone(),
            })),
            Insn::CheckCast(class) => {
                let value = frame.pop_read(id)?;
                let desc = match value.desc {
                    ValueDescriptor::Null => ValueDescriptor::Null,
                    _ => ValueDescriptor::Object(class.clone()),
                };
                frame.push(FrameValue::new(desc, value.origin));
            }
            Insn::GetField { ty, .. } => {
                frame.pop_read(id)?;
                push_result(&mut frame, ty, id);
            }
            Insn::PutField { .. } => {
                frame.pop_n_read(2, id)?;
            }

            Insn::Invoke { kind, method } => {
                frame.pop_n_read(method.sig.params.len(), id)?;
                if *kind != InvokeKind::Static {
                    let receiver = frame.pop_read(id)?;
                    if *kind == InvokeKind::Constructor {
                        if let ValueDescriptor::Uninitialized { class, .. } = &receiver.desc {
                            let constructed = ValueDescriptor::Object(class.clone());
                            frame.replace_desc(&receiver.desc, &constructed);
                        }
                    }
                }
                push_result(&mut frame, &method.sig.ret, id);
            }
            Insn::MakeClosure { captured, .. } => {
                frame.pop_n_read(*captured, id)?;
                frame.push(produced(ValueDescriptor::Object(CLOSURE_CLASS.to_string())));
            }
            Insn::InvokeClosure { sig } => {
                frame.pop_n_read(sig.params.len() + 1, id)?;
                push_result(&mut frame, &sig.ret, id);
            }

            Insn::MonitorEnter => {
                let value = frame.pop_read(id)?;
                frame.monitors.push(value);
            }
            Insn::MonitorExit => {
                let value = frame.pop_read(id)?;
                let held = frame
                    .monitors
                    .iter()
                    .rposition(|m| m.origin == value.origin)
                    .ok_or(AnalysisError::UnbalancedMonitor { at: id })?;
                frame.monitors.remove(held);
            }
            Insn::Throw => {
                frame.pop_read(id)?;
            }
            Insn::Return(kind) => {
                if kind.is_some() {
                    frame.pop_read(id)?;
                }
            }
        }

        Ok(frame)
    }
}

fn push_result(frame: &mut AbstractFrame, ret: &Type, id: InsnId) {
    if let Some(desc) = ValueDescriptor::from_type(ret) {
        frame.push(FrameValue::new(desc, Origin::Insn(id)));
    }
}
