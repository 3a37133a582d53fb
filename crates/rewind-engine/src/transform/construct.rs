//! Deferred construction
//!
//! An object allocated before a suspension point and constructed after it
//! would have to be captured while unconstructed, which is not possible. The
//! allocation is moved down to the constructor call instead:
//!
//! ```text
//! new Box; dup; <args>; invoke Box.<init>
//! ```
//!
//! becomes
//!
//! ```text
//! <args>; store args; new Box; dup; load args; invoke Box.<init>
//! ```
//!
//! Only the plain pattern is supported: the `New` is followed by `Dup`s, and
//! every copy of the reference stays in place on the stack until the
//! constructor consumes the topmost one.

use super::analyzer::Frames;
use super::error::TransformErrorKind;
use super::frame::{AbstractFrame, ValueDescriptor};
use super::locate::SuspensionSite;
use rewind_bytecode::{
    CompiledMethod, FrameType, Insn, InsnId, InvokeKind, LabelId, ValueKind,
};
use rustc_hash::FxHashSet;

struct Plan {
    new_insn: InsnId,
    class: String,
    dups: Vec<InsnId>,
    ctor: InsnId,
    args: Vec<(ValueKind, u16)>,
    labels: FxHashSet<LabelId>,
}

/// Allocation sites whose unconstructed object is live at a suspension point
pub fn hazards(sites: &[SuspensionSite]) -> Vec<InsnId> {
    let mut out: Vec<InsnId> = sites
        .iter()
        .flat_map(|site| site.frame.uninitialized_sites())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Move every hazardous allocation down to its constructor call
///
/// Returns the number of rewritten allocations. `frames` must describe the
/// current body of `method`.
pub fn rewrite_constructions(
    method: &mut CompiledMethod,
    frames: &Frames,
    sites: &[SuspensionSite],
) -> Result<usize, TransformErrorKind> {
    let sites = hazards(sites);
    if sites.is_empty() {
        return Ok(0);
    }

    let mut next_local = method.max_locals;
    let mut plans = Vec::with_capacity(sites.len());
    for site in sites {
        let plan = plan_one(method, frames, site, &mut next_local)?;
        plans.push(plan);
    }

    for plan in &plans {
        apply(method, plan);
        tracing::debug!(
            method = %method.name,
            class = %plan.class,
            copies = plan.dups.len() + 1,
            "deferred allocation to its constructor"
        );
    }
    method.max_locals = next_local;
    Ok(plans.len())
}

fn unsupported(class: &str, reason: impl Into<String>) -> TransformErrorKind {
    TransformErrorKind::UnsupportedConstruction {
        class: class.to_string(),
        reason: reason.into(),
    }
}

fn plan_one(
    method: &CompiledMethod,
    frames: &Frames,
    new_insn: InsnId,
    next_local: &mut u16,
) -> Result<Plan, TransformErrorKind> {
    let class = match method.code.get(new_insn) {
        Insn::New(class) => class.clone(),
        _ => return Err(unsupported("?", "allocation site is not a new instruction")),
    };
    let desc = ValueDescriptor::Uninitialized {
        site: new_insn,
        class: class.clone(),
    };
    let base = frames
        .at(new_insn)
        .map(|frame| frame.stack.len())
        .ok_or_else(|| unsupported(&class, "allocation is unreachable"))?;

    let mut dups = Vec::new();
    let mut cursor = method.code.next(new_insn);
    while let Some(id) = cursor {
        match method.code.get(id) {
            Insn::Dup => dups.push(id),
            Insn::Line(_) | Insn::Nop => {}
            _ => break,
        }
        cursor = method.code.next(id);
    }
    let copies = dups.len() + 1;

    let mut ctor = None;
    for (id, frame) in frames.iter() {
        if id == new_insn || dups.contains(&id) {
            continue;
        }
        check_copies(frame, &desc, base, copies, &class)?;

        if let Insn::Invoke {
            kind: InvokeKind::Constructor,
            method: target,
        } = method.code.get(id)
        {
            let receiver = frame
                .stack
                .len()
                .checked_sub(target.sig.params.len() + 1)
                .and_then(|i| frame.stack.get(i).map(|v| (i, v)));
            if let Some((index, value)) = receiver {
                if value.desc == desc {
                    if ctor.is_some() {
                        return Err(unsupported(&class, "constructed at more than one call"));
                    }
                    if index != base + copies - 1 {
                        return Err(unsupported(&class, "receiver is not the topmost copy"));
                    }
                    ctor = Some((id, target.sig.params.clone()));
                }
            }
        }
    }
    let (ctor, params) = ctor.ok_or_else(|| unsupported(&class, "no constructor call"))?;

    let mut args = Vec::with_capacity(params.len());
    for param in &params {
        let kind = param
            .kind()
            .ok_or_else(|| unsupported(&class, format!("constructor parameter of type {}", param)))?;
        args.push((kind, *next_local));
        *next_local += kind.slots();
    }

    Ok(Plan {
        new_insn,
        class,
        dups,
        ctor,
        args,
        labels: labels_for(method, new_insn),
    })
}

/// Every copy must sit in the block of stack entries just above `base`
fn check_copies(
    frame: &AbstractFrame,
    desc: &ValueDescriptor,
    base: usize,
    copies: usize,
    class: &str,
) -> Result<(), TransformErrorKind> {
    if frame.locals.iter().flatten().any(|v| &v.desc == desc) {
        return Err(unsupported(class, "reference is stored in a local variable"));
    }
    let positions: Vec<usize> = frame
        .stack
        .iter()
        .enumerate()
        .filter(|(_, v)| &v.desc == desc)
        .map(|(i, _)| i)
        .collect();
    if positions.is_empty() {
        return Ok(());
    }
    if positions.len() != copies || positions.iter().enumerate().any(|(n, &i)| i != base + n) {
        return Err(unsupported(class, "copies are moved on the operand stack"));
    }
    Ok(())
}

/// Labels whose `Uninitialized` frame type resolves to `site`
fn labels_for(method: &CompiledMethod, site: InsnId) -> FxHashSet<LabelId> {
    let mut labels = FxHashSet::default();
    let mut pending: Vec<LabelId> = Vec::new();
    for (id, insn) in method.code.iter() {
        match insn {
            Insn::Label(label) => pending.push(*label),
            Insn::New(_) => {
                if id == site {
                    labels.extend(pending.iter().copied());
                    break;
                }
                pending.clear();
            }
            _ => {}
        }
    }
    labels
}

fn apply(method: &mut CompiledMethod, plan: &Plan) {
    let mut seq: Vec<Insn> = plan
        .args
        .iter()
        .rev()
        .map(|&(kind, slot)| Insn::Store { kind, slot })
        .collect();
    seq.push(Insn::New(plan.class.clone()));
    seq.extend(std::iter::repeat(Insn::Dup).take(plan.dups.len()));
    seq.extend(plan.args.iter().map(|&(kind, slot)| Insn::Load { kind, slot }));
    method.code.insert_all_before(plan.ctor, seq);

    method.code.remove(plan.new_insn);
    for dup in &plan.dups {
        method.code.remove(*dup);
    }

    if plan.labels.is_empty() {
        return;
    }
    for id in method.code.ids() {
        if let Insn::Frame(assertion) = method.code.get_mut(id) {
            assertion
                .stack
                .retain(|ty| !matches!(ty, FrameType::Uninitialized(label) if plan.labels.contains(label)));
        }
    }
}
