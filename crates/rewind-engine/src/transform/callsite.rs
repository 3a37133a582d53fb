//! Call-site rewriting
//!
//! Replaces the surface async vocabulary with the future library:
//! - await calls that were not turned into suspension points become
//!   `Futures.get`
//! - composition helpers on the await owner are retargeted to the future
//!   library
//! - the marker type becomes the future type wherever a type is named

use super::error::TransformErrorKind;
use super::locate::is_await;
use super::options::TransformOptions;
use rewind_bytecode::names::GET_METHOD;
use rewind_bytecode::{
    CompiledMethod, FrameType, Insn, InvokeKind, MethodRef, Signature, Type,
};

/// What [`rewrite_call_sites`] changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSiteReport {
    /// Await calls replaced by a blocking `get`
    pub awaits: usize,
    /// Composition helper calls retargeted to the future library
    pub helpers: usize,
    /// Closure bodies returning the marker type, with mapped signatures
    pub closure_targets: Vec<MethodRef>,
}

/// Reject methods that take the marker type as a parameter
pub fn check_parameters(method: &CompiledMethod, options: &TransformOptions) -> Result<(), TransformErrorKind> {
    match method.sig.params.iter().position(|ty| options.is_marker(ty)) {
        Some(index) => Err(TransformErrorKind::AwaitableParameter {
            index,
            ty: options.awaitable_type.clone(),
        }),
        None => Ok(()),
    }
}

fn is_helper(method: &MethodRef, options: &TransformOptions) -> bool {
    method.owner == options.await_owner && options.composition_helpers.iter().any(|h| *h == method.name)
}

fn insn_mentions_marker(insn: &Insn, options: &TransformOptions) -> bool {
    let marker = |ty: &Type| options.is_marker(ty);
    match insn {
        Insn::Invoke { method, .. } | Insn::MakeClosure { method, .. } => method.sig.mentions(marker),
        Insn::InvokeClosure { sig } => sig.mentions(marker),
        Insn::GetField { ty, .. } | Insn::PutField { ty, .. } => marker(ty),
        Insn::CheckCast(class) | Insn::New(class) => *class == options.awaitable_type,
        Insn::Frame(assertion) => assertion
            .locals
            .iter()
            .chain(&assertion.stack)
            .any(|t| matches!(t, FrameType::Object(c) if *c == options.awaitable_type)),
        _ => false,
    }
}

/// Whether the method uses any of the surface async vocabulary
///
/// A method for which this is false is left untouched by the transform,
/// which makes the pass idempotent.
pub fn needs_transform(method: &CompiledMethod, options: &TransformOptions) -> bool {
    if method.sig.mentions(|ty| options.is_marker(ty)) {
        return true;
    }
    if method
        .generic_signature
        .as_deref()
        .is_some_and(|g| g.contains(&options.awaitable_type))
    {
        return true;
    }
    if method.local_vars.iter().any(|v| options.is_marker(&v.ty)) {
        return true;
    }
    method.code.iter().any(|(_, insn)| {
        is_await(insn, options)
            || insn_mentions_marker(insn, options)
            || matches!(insn, Insn::Invoke { method, .. } if is_helper(method, options))
    })
}

/// `sig` with the marker type replaced by the future type
pub fn map_signature(sig: &Signature, options: &TransformOptions) -> Signature {
    sig.map_types(|ty| options.map_type(ty))
}

fn map_frame_type(ty: &mut FrameType, options: &TransformOptions) {
    if let FrameType::Object(class) = ty {
        if *class == options.awaitable_type {
            *class = options.future_type.clone();
        }
    }
}

/// Rewrite the remaining surface calls and types of `method` in place
pub fn rewrite_call_sites(method: &mut CompiledMethod, options: &TransformOptions) -> CallSiteReport {
    let mut report = CallSiteReport::default();

    method.sig = map_signature(&method.sig, options);
    if let Some(generic) = &mut method.generic_signature {
        *generic = generic.replace(&options.awaitable_type, &options.future_type);
    }
    for var in &mut method.local_vars {
        var.ty = options.map_type(&var.ty);
    }

    for id in method.code.ids() {
        let insn = method.code.get_mut(id);
        if is_await(insn, options) {
            if let Insn::Invoke { method: target, .. } = insn {
                let ret = options.map_type(&target.sig.ret);
                *insn = Insn::Invoke {
                    kind: InvokeKind::Static,
                    method: MethodRef::new(
                        options.futures_owner.clone(),
                        GET_METHOD,
                        Signature::new(vec![options.future()], ret),
                    ),
                };
                report.awaits += 1;
            }
            continue;
        }

        match insn {
            Insn::Invoke { method: target, .. } => {
                if is_helper(target, options) {
                    target.owner = options.futures_owner.clone();
                    report.helpers += 1;
                }
                target.sig = map_signature(&target.sig, options);
            }
            Insn::MakeClosure { method: target, .. } => {
                if options.is_marker(&target.sig.ret) {
                    report.closure_targets.push(MethodRef::new(
                        target.owner.clone(),
                        target.name.clone(),
                        map_signature(&target.sig, options),
                    ));
                }
                target.sig = map_signature(&target.sig, options);
            }
            Insn::InvokeClosure { sig } => *sig = map_signature(sig, options),
            Insn::GetField { ty, .. } | Insn::PutField { ty, .. } => *ty = options.map_type(ty),
            Insn::CheckCast(class) => {
                if *class == options.awaitable_type {
                    *class = options.future_type.clone();
                }
            }
            Insn::Frame(assertion) => {
                for ty in assertion.locals.iter_mut().chain(assertion.stack.iter_mut()) {
                    map_frame_type(ty, options);
                }
            }
            _ => {}
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_bytecode::names::{ASYNC_CLASS, AWAITABLE_CLASS, FUTURES_CLASS, OBJECT_CLASS};
    use rewind_bytecode::{MethodBuilder, ValueKind};

    fn marker() -> Type {
        Type::object(AWAITABLE_CLASS)
    }

    #[test]
    fn test_marker_parameter_is_rejected() {
        let options = TransformOptions::default();
        let method = CompiledMethod::new("f", Signature::new(vec![Type::Int, marker()], marker()), true);
        assert_eq!(
            check_parameters(&method, &options),
            Err(TransformErrorKind::AwaitableParameter {
                index: 1,
                ty: AWAITABLE_CLASS.to_string()
            })
        );
    }

    #[test]
    fn test_rewrites_types_and_calls() {
        let options = TransformOptions::default();
        let mut b = MethodBuilder::new("f", Signature::new(vec![], marker()), true);
        let (start, end) = (b.new_label(), b.new_label());
        b.generic_signature("() -> rewind.Awaitable<T>")
            .label(start)
            .make_closure(
                MethodRef::new("demo.A", "lambda$0", Signature::new(vec![], marker())),
                0,
            )
            .store(ValueKind::Ref, 0)
            .load(ValueKind::Ref, 0)
            .invoke_closure(Signature::new(vec![], marker()))
            .invoke_static(ASYNC_CLASS, "all", Signature::new(vec![marker()], marker()))
            .check_cast(AWAITABLE_CLASS)
            .label(end)
            .ret(Some(ValueKind::Ref))
            .local_var("task", 0, Type::object("rewind.Closure"), start, end)
            .local_var("result", 1, marker(), start, end);
        let mut method = b.finish_unchecked();
        assert!(needs_transform(&method, &options));

        let report = rewrite_call_sites(&mut method, &options);
        assert_eq!(report.helpers, 1);
        assert_eq!(report.closure_targets.len(), 1);
        assert_eq!(report.closure_targets[0].sig.ret, options.future());
        assert_eq!(method.sig.ret, options.future());
        assert_eq!(method.generic_signature.as_deref(), Some("() -> rewind.Future<T>"));
        assert_eq!(method.local_vars[1].ty, options.future());

        let helper = method
            .code
            .iter()
            .find_map(|(_, insn)| match insn {
                Insn::Invoke { method, .. } => Some(method.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(helper.owner, FUTURES_CLASS);
        assert_eq!(helper.sig.params, vec![options.future()]);
        assert!(!needs_transform(&method, &options));
    }

    #[test]
    fn test_remaining_await_becomes_get() {
        let options = TransformOptions::default();
        let mut b = MethodBuilder::new("f", Signature::new(vec![options.future()], options.future()), true);
        b.load(ValueKind::Ref, 0)
            .invoke_static(ASYNC_CLASS, "await", Signature::new(vec![options.future()], Type::object(OBJECT_CLASS)))
            .pop()
            .load(ValueKind::Ref, 0)
            .ret(Some(ValueKind::Ref));
        let mut method = b.finish().unwrap();

        let report = rewrite_call_sites(&mut method, &options);
        assert_eq!(report.awaits, 1);
        let get = method.code.to_vec()[1].clone();
        assert_eq!(
            get,
            Insn::Invoke {
                kind: InvokeKind::Static,
                method: MethodRef::new(
                    FUTURES_CLASS,
                    "get",
                    Signature::new(vec![options.future()], Type::object(OBJECT_CLASS))
                ),
            }
        );
    }

    #[test]
    fn test_plain_method_needs_nothing() {
        let options = TransformOptions::default();
        let mut b = MethodBuilder::new("f", Signature::new(vec![Type::Int], Type::Int), true);
        b.load(ValueKind::Int, 0).ret(Some(ValueKind::Int));
        assert!(!needs_transform(&b.finish().unwrap(), &options));
    }
}
