//! Suspension point location
//!
//! Finds every reachable call to the await primitive and numbers it. State 0
//! is the initial entry, so resume ids start at 1.

use super::analyzer::Frames;
use super::capture::SlotMapping;
use super::diagnostics::{DiagnosticSink, Location};
use super::frame::{AbstractFrame, ValueDescriptor};
use super::options::TransformOptions;
use rewind_bytecode::{CompiledMethod, Insn, InsnId, InvokeKind};

/// A call to the await primitive that may suspend the method
#[derive(Debug, Clone)]
pub struct SuspensionSite {
    /// The await call
    pub insn: InsnId,
    /// Program position of the call when located
    pub position: usize,
    /// Dispatch state that resumes after this call
    pub resume_id: u32,
    /// Frame before the call; the awaited future is on top of the stack
    pub frame: AbstractFrame,
    /// Source line of the call
    pub line: Option<u32>,
    /// Captured-variable mapping, attached by the capture planner
    pub mapping: Option<SlotMapping>,
}

/// Whether `insn` calls the await primitive named by `options`
pub fn is_await(insn: &Insn, options: &TransformOptions) -> bool {
    match insn {
        Insn::Invoke {
            kind: InvokeKind::Static,
            method,
        } => method.is(&options.await_owner, &options.await_name) && method.sig.params.len() == 1,
        _ => false,
    }
}

/// Source line in effect at `id`: the nearest preceding `Line` marker
pub fn line_of(method: &CompiledMethod, id: InsnId) -> Option<u32> {
    let mut cursor = Some(id);
    while let Some(current) = cursor {
        if let Insn::Line(line) = method.code.get(current) {
            return Some(*line);
        }
        cursor = method.code.prev(current);
    }
    None
}

/// Locate the suspension sites of `method`
///
/// With a sink, each `Pop` that discards a future or marker value is reported
/// once. Control flow is untouched.
pub fn locate(
    owner: &str,
    method: &CompiledMethod,
    frames: &Frames,
    options: &TransformOptions,
    sink: Option<&dyn DiagnosticSink>,
) -> Vec<SuspensionSite> {
    let mut sites = Vec::new();
    let mut line = None;
    let mut next_id = 1u32;

    for (position, (id, insn)) in method.code.iter().enumerate() {
        if let Insn::Line(n) = insn {
            line = Some(*n);
            continue;
        }
        let Some(frame) = frames.at(id) else {
            continue;
        };

        if is_await(insn, options) {
            sites.push(SuspensionSite {
                insn: id,
                position,
                resume_id: next_id,
                frame: frame.clone(),
                line,
                mapping: None,
            });
            next_id += 1;
        } else if let (Insn::Pop, Some(sink)) = (insn, sink) {
            if !options.warn_dropped_futures {
                continue;
            }
            if let Some(ValueDescriptor::Object(class)) = frame.stack.last().map(|v| &v.desc) {
                if class == &options.future_type || class == &options.awaitable_type {
                    sink.warn(
                        &Location::new(owner, method.name.clone(), line),
                        &format!("dropped stage: value of type {} is discarded without being awaited", class),
                    );
                }
            }
        }
    }

    sites
}
