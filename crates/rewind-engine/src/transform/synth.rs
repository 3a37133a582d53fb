//! Continuation synthesis
//!
//! A method with suspension points is split in two:
//!
//! - The **entry** keeps the original name and signature. It passes its
//!   parameters to the continuation with state 0 and returns the future the
//!   continuation produces. Anything thrown before the first suspension
//!   becomes a rejected future.
//! - The **continuation** is a static method
//!   `(captured..., int state, Future) -> Future` holding the original body.
//!   Its prologue switches on the state: state 0 restores the entry locals
//!   and starts at the top, state `k` restores the frame of suspension point
//!   `k` and jumps just past it.
//!
//! Each await call becomes a completion check. A completed future continues
//! inline. Otherwise the frame is packed into a closure over the
//! continuation, chained onto the future with `compose`, and the composed
//! future is returned.

use super::capture::{CapturePlan, SlotMapping};
use super::error::TransformErrorKind;
use super::frame::{AbstractFrame, ValueDescriptor};
use super::locate::SuspensionSite;
use super::options::TransformOptions;
use rewind_bytecode::names::{
    CLOSURE_CLASS, COMPOSE_METHOD, GET_METHOD, IS_DONE_METHOD, OBJECT_CLASS, REJECTED_METHOD,
};
use rewind_bytecode::{
    verify_method, CompiledMethod, Cond, Constant, ExceptionHandler, FrameType, Insn, InsnId,
    InvokeKind, LabelId, LocalVariable, MethodRef, Signature, Type, ValueKind,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Message of the exception thrown for an unknown resume state
pub const BAD_STATE_MESSAGE: &str = "unknown resume state";

/// Output of [`synthesize`]
#[derive(Debug, Clone)]
pub struct Synthesized {
    /// Replacement for the original method
    pub entry: CompiledMethod,
    /// The continuation holding the original body
    pub continuation: CompiledMethod,
    /// Local slot of the state parameter in the continuation
    pub dispatch_param: u16,
    /// Local slot of the resumed-future parameter in the continuation
    pub future_param: u16,
}

fn kind_of(ty: &Type) -> ValueKind {
    ty.kind().unwrap_or(ValueKind::Ref)
}

fn frame_types(ty: &Type) -> Vec<FrameType> {
    match ty {
        Type::Void => vec![],
        Type::Bool | Type::Int => vec![FrameType::Int],
        Type::Long => vec![FrameType::Long, FrameType::Top],
        Type::Float => vec![FrameType::Float],
        Type::Double => vec![FrameType::Double, FrameType::Top],
        Type::Object(class) => vec![FrameType::Object(class.clone())],
    }
}

fn invoke_static(owner: &str, name: &str, sig: Signature) -> Insn {
    Insn::Invoke {
        kind: InvokeKind::Static,
        method: MethodRef::new(owner, name, sig),
    }
}

/// Layout of the continuation's locals
struct Layout {
    /// Slot of each captured parameter
    offsets: Vec<u16>,
    /// Slots taken by all parameters; original locals start here
    shift: u16,
    state: u16,
    future: u16,
    /// Holds the awaited future on the slow path
    tmp_future: u16,
}

struct Synthesizer<'a> {
    owner: &'a str,
    method: &'a CompiledMethod,
    plan: &'a CapturePlan,
    options: &'a TransformOptions,
    layout: Layout,
    continuation: MethodRef,
    body: CompiledMethod,
    resume_labels: FxHashMap<u32, LabelId>,
    max_temp: u16,
}

/// Split `method` at its suspension points
///
/// `sites` must carry mappings from the capture planner. Types are emitted
/// as found; the call-site rewriter maps the marker type afterwards.
pub fn synthesize(
    owner: &str,
    method: &CompiledMethod,
    sites: &[SuspensionSite],
    plan: &CapturePlan,
    continuation_name: &str,
    options: &TransformOptions,
) -> Result<Synthesized, TransformErrorKind> {
    let offsets = plan.param_offsets();
    let captured = plan.slot_count();
    let layout = Layout {
        offsets,
        shift: captured + 2,
        state: captured,
        future: captured + 1,
        tmp_future: captured + 2 + method.max_locals,
    };

    let mut params: Vec<Type> = plan.variables.iter().map(|v| v.ty.clone()).collect();
    params.push(Type::Int);
    params.push(options.future());
    let sig = Signature::new(params, options.future());
    let continuation = MethodRef::new(owner, continuation_name, sig.clone());

    let mut body = CompiledMethod::new(continuation_name, sig, true);
    body.is_synthetic = true;
    body.throws = method.throws.clone();
    body.code = method.code.clone();
    body.handlers = method.handlers.clone();
    body.next_label = method.next_label;
    body.sync_label_counter();

    let mut synth = Synthesizer {
        owner,
        method,
        plan,
        options,
        layout,
        continuation,
        body,
        resume_labels: FxHashMap::default(),
        max_temp: 0,
    };
    synth.check_mappings(sites)?;
    synth.shift_locals();
    for site in sites {
        synth.rewrite_site(site)?;
    }
    synth.emit_dispatch(sites)?;

    let entry = synth.build_entry();
    let dispatch_param = synth.layout.state;
    let future_param = synth.layout.future;
    let mut continuation = synth.body;
    continuation.max_locals = continuation
        .max_locals
        .max(synth.layout.tmp_future + 1 + synth.max_temp);

    tracing::debug!(
        owner,
        method = %method.name,
        continuation = continuation_name,
        sites = sites.len(),
        captured = plan.variables.len(),
        "synthesized continuation"
    );

    Ok(Synthesized {
        entry,
        continuation,
        dispatch_param,
        future_param,
    })
}

/// Settle label counter and `max_stack` of an emitted method
pub fn finish_method(method: &mut CompiledMethod) -> Result<(), TransformErrorKind> {
    method.sync_label_counter();
    method.max_stack = verify_method(method)?;
    Ok(())
}

impl<'a> Synthesizer<'a> {
    fn mapping<'s>(&self, site: &'s SuspensionSite) -> Result<&'s SlotMapping, TransformErrorKind> {
        site.mapping.as_ref().ok_or(TransformErrorKind::MissingCapture {
            resume_id: site.resume_id,
            slot: "frame".to_string(),
        })
    }

    /// Every value that must survive a suspension point has a parameter
    fn check_mappings(&self, sites: &[SuspensionSite]) -> Result<(), TransformErrorKind> {
        for site in sites {
            let mapping = self.mapping(site)?;
            let missing = |slot: String| TransformErrorKind::MissingCapture {
                resume_id: site.resume_id,
                slot,
            };
            for (i, local) in site.frame.locals.iter().enumerate() {
                let needed = local.as_ref().is_some_and(|v| v.desc.to_type().is_some());
                if needed && mapping.locals.get(i).copied().flatten().is_none() {
                    return Err(missing(format!("local[{}]", i)));
                }
            }
            let depth = site.frame.stack.len().saturating_sub(1);
            for (i, value) in site.frame.stack[..depth].iter().enumerate() {
                if value.desc.to_type().is_some() && mapping.stack.get(i).copied().flatten().is_none() {
                    return Err(missing(format!("stack[{}]", i)));
                }
            }
        }
        Ok(())
    }

    /// Move the original locals above the continuation parameters
    fn shift_locals(&mut self) {
        let shift = self.layout.shift;
        let mut prefix: Vec<FrameType> = self
            .plan
            .variables
            .iter()
            .flat_map(|v| frame_types(&v.ty))
            .collect();
        prefix.push(FrameType::Int);
        prefix.push(FrameType::Object(self.options.future_type.clone()));

        for id in self.body.code.ids() {
            match self.body.code.get_mut(id) {
                Insn::Load { slot, .. } | Insn::Store { slot, .. } => *slot += shift,
                Insn::Frame(assertion) => {
                    let mut locals = prefix.clone();
                    locals.append(&mut assertion.locals);
                    assertion.locals = locals;
                }
                _ => {}
            }
        }
        self.body.local_vars = self
            .method
            .local_vars
            .iter()
            .map(|v| LocalVariable {
                slot: v.slot + shift,
                ..v.clone()
            })
            .collect();
        self.body.max_locals = shift + self.method.max_locals;
    }

    fn load_param(&self, index: usize) -> Insn {
        let var = &self.plan.variables[index];
        Insn::Load {
            kind: kind_of(&var.ty),
            slot: self.layout.offsets[index],
        }
    }

    /// Local slot in the shifted body holding the monitor `index` of `frame`
    fn monitor_local(&self, frame: &AbstractFrame, index: usize, resume_id: u32) -> Result<u16, TransformErrorKind> {
        frame
            .local_holding(&frame.monitors[index].origin)
            .map(|slot| slot + self.layout.shift)
            .ok_or(TransformErrorKind::MonitorNotInLocal { resume_id })
    }

    fn rewrite_site(&mut self, site: &SuspensionSite) -> Result<(), TransformErrorKind> {
        let mapping = self.mapping(site)?.clone();
        let frame = &site.frame;
        let depth = frame.stack.len().saturating_sub(1);
        let futures = self.options.futures_owner.clone();
        let future = self.options.future();
        let resume = self.body.new_label();
        let slow = self.body.new_label();

        let mut seq = vec![
            Insn::Dup,
            invoke_static(&futures, IS_DONE_METHOD, Signature::new(vec![future.clone()], Type::Bool)),
            Insn::If { cond: Cond::Ne, target: resume },
            Insn::Label(slow),
            Insn::Store { kind: ValueKind::Ref, slot: self.layout.tmp_future },
        ];

        // Spill the stack, top first
        let mut temps: Vec<Option<(ValueKind, u16)>> = vec![None; depth];
        let mut next = self.layout.tmp_future + 1;
        for i in (0..depth).rev() {
            match frame.stack[i].desc.to_type() {
                Some(ty) => {
                    let kind = kind_of(&ty);
                    temps[i] = Some((kind, next));
                    seq.push(Insn::Store { kind, slot: next });
                    next += kind.slots();
                }
                None => seq.push(Insn::Pop),
            }
        }
        self.max_temp = self.max_temp.max(next - self.layout.tmp_future - 1);

        for i in (0..frame.monitors.len()).rev() {
            let slot = self.monitor_local(frame, i, site.resume_id)?;
            seq.push(Insn::Load { kind: ValueKind::Ref, slot });
            seq.push(Insn::MonitorExit);
        }

        for (index, var) in self.plan.variables.iter().enumerate() {
            let kind = kind_of(&var.ty);
            let from_local = mapping.locals.iter().position(|m| *m == Some(index));
            let from_stack = mapping
                .stack
                .iter()
                .position(|m| *m == Some(index))
                .and_then(|j| temps[j]);
            let insn = match (from_local, from_stack) {
                (Some(slot), _) => Insn::Load {
                    kind,
                    slot: slot as u16 + self.layout.shift,
                },
                (None, Some((kind, slot))) => Insn::Load { kind, slot },
                (None, None) => Insn::Const(Constant::default_for(kind)),
            };
            seq.push(insn);
        }

        seq.push(Insn::Const(Constant::Int(site.resume_id as i32)));
        seq.push(Insn::MakeClosure {
            method: self.continuation.clone(),
            captured: self.plan.variables.len() + 1,
        });
        seq.push(Insn::Load { kind: ValueKind::Ref, slot: self.layout.tmp_future });
        seq.push(Insn::Swap);
        seq.push(invoke_static(
            &futures,
            COMPOSE_METHOD,
            Signature::new(
                vec![future.clone(), Type::object(CLOSURE_CLASS)],
                future.clone(),
            ),
        ));
        seq.push(Insn::Return(Some(ValueKind::Ref)));
        seq.push(Insn::Label(resume));

        let ret = match self.body.code.get(site.insn) {
            Insn::Invoke { method, .. } => self.options.map_type(&method.sig.ret),
            _ => Type::object(OBJECT_CLASS),
        };
        self.body.code.insert_all_before(site.insn, seq);
        self.body.code.replace(
            site.insn,
            invoke_static(&futures, GET_METHOD, Signature::new(vec![future], ret)),
        );
        self.split_handlers(site.insn, slow, resume);
        self.resume_labels.insert(site.resume_id, resume);
        Ok(())
    }

    /// Exclude the slow path between `slow` and `resume` from every handler
    /// range covering `at`
    ///
    /// The slow path has already released the monitors a handler expects.
    fn split_handlers(&mut self, at: InsnId, slow: LabelId, resume: LabelId) {
        let positions: FxHashMap<InsnId, usize> = self
            .body
            .code
            .ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        let labels = self.body.code.label_index();
        let position = |label: &LabelId| labels.get(label).and_then(|id| positions.get(id)).copied();
        let Some(&site) = positions.get(&at) else {
            return;
        };

        let mut handlers = Vec::with_capacity(self.body.handlers.len());
        for h in self.body.handlers.drain(..) {
            let covers = matches!(
                (position(&h.start), position(&h.end)),
                (Some(start), Some(end)) if start <= site && site < end
            );
            if covers {
                handlers.push(ExceptionHandler { end: slow, ..h.clone() });
                handlers.push(ExceptionHandler { start: resume, ..h });
            } else {
                handlers.push(h);
            }
        }
        self.body.handlers = handlers;
    }

    fn emit_dispatch(&mut self, sites: &[SuspensionSite]) -> Result<(), TransformErrorKind> {
        let first = self.body.code.first().ok_or(TransformErrorKind::UnknownResumeState(0))?;
        let start = self.body.new_label();
        let bad = self.body.new_label();
        let entry_block = self.body.new_label();

        let mut cases = vec![(0, entry_block)];
        let mut blocks: Vec<Insn> = Vec::new();

        blocks.push(Insn::Label(bad));
        blocks.push(Insn::Const(Constant::Str(BAD_STATE_MESSAGE.to_string())));
        blocks.push(Insn::Throw);

        blocks.push(Insn::Label(entry_block));
        for (slot, mapped) in self.plan.entry.locals.iter().enumerate() {
            if let Some(index) = mapped {
                let kind = kind_of(&self.plan.variables[*index].ty);
                blocks.push(self.load_param(*index));
                blocks.push(Insn::Store { kind, slot: slot as u16 + self.layout.shift });
            }
        }
        blocks.push(Insn::Jump(start));

        for site in sites {
            let label = self.body.new_label();
            cases.push((site.resume_id as i32, label));
            blocks.push(Insn::Label(label));
            self.restore_block(site, &mut blocks)?;
        }

        let expected: FxHashSet<i32> = std::iter::once(0)
            .chain(sites.iter().map(|s| s.resume_id as i32))
            .collect();
        let covered: FxHashSet<i32> = cases.iter().map(|(k, _)| *k).collect();
        if covered != expected || cases.len() != expected.len() {
            let unknown = sites
                .iter()
                .map(|s| s.resume_id)
                .find(|id| cases.iter().filter(|(k, _)| *k == *id as i32).count() != 1)
                .unwrap_or(0);
            return Err(TransformErrorKind::UnknownResumeState(unknown));
        }

        let mut prologue = vec![
            Insn::Load { kind: ValueKind::Int, slot: self.layout.state },
            Insn::Switch { cases, default: bad },
        ];
        prologue.extend(blocks);
        prologue.push(Insn::Label(start));
        self.body.code.insert_all_before(first, prologue);
        Ok(())
    }

    fn restore_block(&self, site: &SuspensionSite, out: &mut Vec<Insn>) -> Result<(), TransformErrorKind> {
        let mapping = self.mapping(site)?;
        let frame = &site.frame;

        for (i, local) in frame.locals.iter().enumerate() {
            let Some(value) = local else { continue };
            let slot = i as u16 + self.layout.shift;
            match (mapping.locals.get(i).copied().flatten(), &value.desc) {
                (Some(index), _) => {
                    out.push(self.load_param(index));
                    out.push(Insn::Store {
                        kind: kind_of(&self.plan.variables[index].ty),
                        slot,
                    });
                }
                (None, ValueDescriptor::Null) => {
                    out.push(Insn::Const(Constant::Null));
                    out.push(Insn::Store { kind: ValueKind::Ref, slot });
                }
                _ => {}
            }
        }

        let depth = frame.stack.len().saturating_sub(1);
        for i in 0..depth {
            match mapping.stack.get(i).copied().flatten() {
                Some(index) => out.push(self.load_param(index)),
                None => out.push(Insn::Const(Constant::Null)),
            }
        }
        out.push(Insn::Load { kind: ValueKind::Ref, slot: self.layout.future });

        for i in 0..frame.monitors.len() {
            let slot = self.monitor_local(frame, i, site.resume_id)?;
            out.push(Insn::Load { kind: ValueKind::Ref, slot });
            out.push(Insn::MonitorEnter);
        }

        let resume = self
            .resume_labels
            .get(&site.resume_id)
            .copied()
            .ok_or(TransformErrorKind::UnknownResumeState(site.resume_id))?;
        out.push(Insn::Jump(resume));
        Ok(())
    }

    fn build_entry(&self) -> CompiledMethod {
        let method = self.method;
        let mut entry = CompiledMethod::new(method.name.clone(), method.sig.clone(), method.is_static);
        entry.is_synchronized = method.is_synchronized;
        entry.throws = method.throws.clone();
        entry.generic_signature = method.generic_signature.clone();

        let begin = entry.new_label();
        let end = entry.new_label();
        let handler = entry.new_label();
        let params = method.param_slots();
        entry.local_vars = method
            .local_vars
            .iter()
            .filter(|v| v.slot < params)
            .map(|v| LocalVariable {
                start: begin,
                end,
                ..v.clone()
            })
            .collect();

        entry.code.push(Insn::Label(begin));
        if let Some(line) = method.first_line() {
            entry.code.push(Insn::Line(line));
        }
        for (index, var) in self.plan.variables.iter().enumerate() {
            let kind = kind_of(&var.ty);
            let insn = match self.plan.entry.locals.iter().position(|m| *m == Some(index)) {
                Some(slot) => Insn::Load { kind, slot: slot as u16 },
                None => Insn::Const(Constant::default_for(kind)),
            };
            entry.code.push(insn);
        }
        let future = self.options.future();
        entry.code.push(Insn::Const(Constant::Int(0)));
        entry.code.push(Insn::Const(Constant::Null));
        entry.code.push(Insn::Invoke {
            kind: InvokeKind::Static,
            method: self.continuation.clone(),
        });
        entry.code.push(Insn::Label(end));
        entry.code.push(Insn::Return(Some(ValueKind::Ref)));
        entry.code.push(Insn::Label(handler));
        entry.code.push(invoke_static(
            &self.options.futures_owner,
            REJECTED_METHOD,
            Signature::new(vec![Type::object(OBJECT_CLASS)], future),
        ));
        entry.code.push(Insn::Return(Some(ValueKind::Ref)));
        entry.handlers.push(ExceptionHandler {
            start: begin,
            end,
            handler,
            catch_type: None,
        });

        tracing::trace!(owner = self.owner, method = %method.name, "built entry procedure");
        entry
    }
}
