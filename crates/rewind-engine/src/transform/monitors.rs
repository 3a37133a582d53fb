//! Lowering of synchronized methods
//!
//! A synchronized method holds an implicit monitor for its whole body. Once
//! the body is split at suspension points that monitor has to be released
//! and re-acquired like any other, so before splitting it is made explicit:
//!
//! ```text
//!     load this | classMonitor(owner)
//!     store m; load m; monitorenter
//! begin:
//!     <body, each return replaced by a jump to its exit block>
//! end:
//! handler:                              ; catch-all over begin..end
//!     load m; monitorexit; throw
//! exit_i:
//!     load m; monitorexit; return
//! ```
//!
//! The exit blocks sit outside the catch-all so a released monitor is never
//! released twice.

use rewind_bytecode::names::{CLASS_MONITOR_METHOD, OBJECT_CLASS, RUNTIME_CLASS, STRING_CLASS};
use rewind_bytecode::{
    CompiledMethod, Constant, ExceptionHandler, FrameType, Insn, InvokeKind, MethodRef, Signature,
    Type, ValueKind,
};

/// Replace the implicit monitor of a synchronized `method` declared in
/// `owner` with explicit monitor instructions
///
/// Returns the local slot holding the monitor, or `None` when the method is
/// not synchronized or has no code.
pub fn lower_synchronized(owner: &str, method: &mut CompiledMethod) -> Option<u16> {
    if !method.is_synchronized {
        return None;
    }
    let first = method.code.first()?;

    let slot = method.max_locals.max(method.param_slots());
    method.max_locals = slot + 1;
    method.is_synchronized = false;

    let held = if method.is_static {
        OBJECT_CLASS.to_string()
    } else {
        owner.to_string()
    };
    pad_frame_assertions(method, slot, &held);

    let begin = method.new_label();
    let end = method.new_label();
    let handler = method.new_label();

    let mut exits = Vec::new();
    for id in method.code.ids() {
        if let Insn::Return(kind) = method.code.get(id) {
            let kind = *kind;
            let exit = method.new_label();
            method.code.replace(id, Insn::Jump(exit));
            exits.push((exit, kind));
        }
    }

    let mut prologue = if method.is_static {
        vec![
            Insn::Const(Constant::Str(owner.to_string())),
            Insn::Invoke {
                kind: InvokeKind::Static,
                method: MethodRef::new(
                    RUNTIME_CLASS,
                    CLASS_MONITOR_METHOD,
                    Signature::new(vec![Type::object(STRING_CLASS)], Type::object(OBJECT_CLASS)),
                ),
            },
        ]
    } else {
        vec![Insn::Load { kind: ValueKind::Ref, slot: 0 }]
    };
    prologue.extend([
        Insn::Store { kind: ValueKind::Ref, slot },
        Insn::Load { kind: ValueKind::Ref, slot },
        Insn::MonitorEnter,
        Insn::Label(begin),
    ]);
    method.code.insert_all_before(first, prologue);

    let mut tail = vec![
        Insn::Label(end),
        Insn::Label(handler),
        Insn::Load { kind: ValueKind::Ref, slot },
        Insn::MonitorExit,
        Insn::Throw,
    ];
    for (exit, kind) in exits {
        tail.extend([
            Insn::Label(exit),
            Insn::Load { kind: ValueKind::Ref, slot },
            Insn::MonitorExit,
            Insn::Return(kind),
        ]);
    }
    for insn in tail {
        method.code.push(insn);
    }

    // innermost handlers come first, so this one goes last
    method.handlers.push(ExceptionHandler {
        start: begin,
        end,
        handler,
        catch_type: None,
    });

    tracing::debug!(owner, method = %method.name, slot, "lowered implicit monitor");
    Some(slot)
}

/// Make every frame assertion keep the monitor local alive
fn pad_frame_assertions(method: &mut CompiledMethod, slot: u16, held: &str) {
    let slot = usize::from(slot);
    for id in method.code.ids() {
        if let Insn::Frame(assertion) = method.code.get_mut(id) {
            if assertion.locals.len() <= slot {
                assertion.locals.resize(slot, FrameType::Top);
                assertion.locals.push(FrameType::Object(held.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::analyzer::analyze;
    use rewind_bytecode::{verify_method, Cond, MethodBuilder};

    fn synchronized(is_static: bool) -> CompiledMethod {
        let params = vec![Type::Int];
        let mut b = MethodBuilder::new("f", Signature::new(params, Type::Int), is_static);
        let arg = if is_static { 0 } else { 1 };
        let negative = b.new_label();
        b.load(ValueKind::Int, arg)
            .if_cond(Cond::Lt, negative)
            .load(ValueKind::Int, arg)
            .ret(Some(ValueKind::Int))
            .label(negative)
            .iconst(0)
            .ret(Some(ValueKind::Int));
        let mut method = b.finish().unwrap();
        method.is_synchronized = true;
        method
    }

    #[test]
    fn test_instance_monitor_is_explicit() {
        let mut method = synchronized(false);
        let slot = lower_synchronized("demo.A", &mut method).unwrap();
        assert_eq!(slot, 2);
        assert_eq!(method.max_locals, 3);
        assert!(!method.is_synchronized);
        assert_eq!(method.handlers.len(), 1);
        assert_eq!(method.handlers[0].catch_type, None);

        let code = method.code.to_vec();
        assert_eq!(code[0], Insn::Load { kind: ValueKind::Ref, slot: 0 });
        assert_eq!(code[3], Insn::MonitorEnter);
        let exits = code.iter().filter(|i| **i == Insn::MonitorExit).count();
        assert_eq!(exits, 3);

        verify_method(&method).unwrap();
        let frames = analyze("demo.A", &method, 10_000).unwrap();
        for (id, insn) in method.code.iter() {
            if let Insn::Return(_) = insn {
                assert!(frames.at(id).unwrap().monitors.is_empty());
            }
        }
    }

    #[test]
    fn test_static_monitor_comes_from_the_runtime() {
        let mut method = synchronized(true);
        lower_synchronized("demo.A", &mut method).unwrap();
        let code = method.code.to_vec();
        assert_eq!(code[0], Insn::Const(Constant::Str("demo.A".into())));
        assert!(matches!(&code[1], Insn::Invoke { method, .. }
            if method.owner == RUNTIME_CLASS && method.name == CLASS_MONITOR_METHOD));
        analyze("demo.A", &method, 10_000).unwrap();
    }

    #[test]
    fn test_plain_method_is_left_alone() {
        let mut method = synchronized(true);
        method.is_synchronized = false;
        let before = method.clone();
        assert_eq!(lower_synchronized("demo.A", &mut method), None);
        assert_eq!(method, before);
    }
}
