//! Native future library
//!
//! Natives are keyed by `"owner.name"`; any signature of that name resolves
//! to the same function. The `rewind.Futures` set is what transformed code
//! calls. The `rewind.Async` set lets untransformed code run, with `await`
//! blocking the calling thread until the future settles.

use super::future::{Future, Outcome};
use super::value::{Closure, Value};
use super::{Vm, VmError, VmResult};
use parking_lot::Mutex;
use rewind_bytecode::names::{
    ALL_METHOD, ASYNC_CLASS, AWAIT_METHOD, CLASS_MONITOR_METHOD, COMPLETED_METHOD, COMPOSE_METHOD,
    FUTURES_CLASS, GET_METHOD, IS_DONE_METHOD, MAP_METHOD, PENDING_METHOD, REJECTED_METHOD,
    RUN_ON_COMPLETION_METHOD, RUNTIME_CLASS,
};
use std::sync::Arc;

/// Native implementation of a method
pub type NativeFn = Arc<dyn Fn(&Vm, Vec<Value>) -> VmResult<Value> + Send + Sync>;

fn arg(args: &[Value], index: usize) -> VmResult<&Value> {
    args.get(index).ok_or_else(|| VmError::TypeError {
        expected: "argument",
        found: format!("{} arguments", args.len()),
    })
}

fn future_arg(args: &[Value], index: usize) -> VmResult<Future> {
    arg(args, index)?.as_future().cloned()
}

fn closure_arg(args: &[Value], index: usize) -> VmResult<Arc<Closure>> {
    arg(args, index)?.as_closure().cloned()
}

/// Exception value carried by a failed call
fn exception_of(err: VmError) -> Value {
    match err {
        VmError::Thrown(value) => value,
        other => Value::str(other.to_string()),
    }
}

/// Settle `target` with the result of a call returning a value or a future
fn settle_from(target: &Future, result: VmResult<Value>) {
    match result {
        Ok(Value::Future(inner)) => {
            let target = target.clone();
            inner.on_complete(move |outcome| {
                target.settle(outcome.clone());
            });
        }
        Ok(value) => {
            target.complete(value);
        }
        Err(err) => {
            target.fail(exception_of(err));
        }
    }
}

fn get(args: Vec<Value>) -> VmResult<Value> {
    match future_arg(&args, 0)?.outcome() {
        Some(Outcome::Completed(value)) => Ok(value),
        Some(Outcome::Failed(error)) => Err(VmError::Thrown(error)),
        None => Err(VmError::NotDone),
    }
}

fn compose(vm: &Vm, args: Vec<Value>) -> VmResult<Value> {
    let source = future_arg(&args, 0)?;
    let closure = closure_arg(&args, 1)?;
    let composed = Future::pending();
    vm.stats().record_completion();

    let vm = vm.clone();
    let target = composed.clone();
    let settled = source.clone();
    source.on_complete(move |_| {
        let result = vm.call_closure(&closure, vec![Value::Future(settled)]);
        settle_from(&target, result);
    });
    Ok(Value::Future(composed))
}

fn run_on_completion(vm: &Vm, args: Vec<Value>) -> VmResult<Value> {
    let source = future_arg(&args, 0)?;
    let closure = closure_arg(&args, 1)?;
    vm.stats().record_completion();

    let vm = vm.clone();
    let settled = source.clone();
    source.on_complete(move |_| {
        if let Err(err) = vm.call_closure(&closure, vec![Value::Future(settled)]) {
            tracing::warn!(error = %err, "completion callback failed");
        }
    });
    Ok(Value::Null)
}

fn map(vm: &Vm, args: Vec<Value>) -> VmResult<Value> {
    let source = future_arg(&args, 0)?;
    let closure = closure_arg(&args, 1)?;
    let mapped = Future::pending();

    let vm = vm.clone();
    let target = mapped.clone();
    source.on_complete(move |outcome| match outcome {
        Outcome::Completed(value) => {
            let result = vm.call_closure(&closure, vec![value.clone()]);
            settle_from(&target, result);
        }
        Outcome::Failed(error) => {
            target.fail(error.clone());
        }
    });
    Ok(Value::Future(mapped))
}

/// Future completing with null once every argument future completes
///
/// Fails with the first failure.
fn all(args: Vec<Value>) -> VmResult<Value> {
    let futures = args
        .iter()
        .map(|v| v.as_future().cloned())
        .collect::<VmResult<Vec<_>>>()?;
    if futures.is_empty() {
        return Ok(Value::Future(Future::completed(Value::Null)));
    }

    let joined = Future::pending();
    let remaining = Arc::new(Mutex::new(futures.len()));
    for future in futures {
        let target = joined.clone();
        let remaining = Arc::clone(&remaining);
        future.on_complete(move |outcome| match outcome {
            Outcome::Completed(_) => {
                let mut left = remaining.lock();
                *left -= 1;
                if *left == 0 {
                    target.complete(Value::Null);
                }
            }
            Outcome::Failed(error) => {
                target.fail(error.clone());
            }
        });
    }
    Ok(Value::Future(joined))
}

fn await_blocking(args: Vec<Value>) -> VmResult<Value> {
    match future_arg(&args, 0)?.wait() {
        Outcome::Completed(value) => Ok(value),
        Outcome::Failed(error) => Err(VmError::Thrown(error)),
    }
}

/// Register the future library on `vm`
pub fn install(vm: &Vm) {
    vm.register_native(FUTURES_CLASS, IS_DONE_METHOD, |_, args| {
        Ok(Value::Int(i32::from(future_arg(&args, 0)?.is_done())))
    });
    vm.register_native(FUTURES_CLASS, GET_METHOD, |_, args| get(args));
    vm.register_native(FUTURES_CLASS, COMPOSE_METHOD, compose);
    vm.register_native(FUTURES_CLASS, RUN_ON_COMPLETION_METHOD, run_on_completion);
    vm.register_native(FUTURES_CLASS, COMPLETED_METHOD, |_, args| {
        Ok(Value::Future(Future::completed(arg(&args, 0)?.clone())))
    });
    vm.register_native(FUTURES_CLASS, REJECTED_METHOD, |_, args| {
        Ok(Value::Future(Future::failed(arg(&args, 0)?.clone())))
    });
    vm.register_native(FUTURES_CLASS, PENDING_METHOD, |_, _| {
        Ok(Value::Future(Future::pending()))
    });
    vm.register_native(FUTURES_CLASS, ALL_METHOD, |_, args| all(args));
    vm.register_native(FUTURES_CLASS, MAP_METHOD, map);

    vm.register_native(ASYNC_CLASS, AWAIT_METHOD, |_, args| await_blocking(args));
    vm.register_native(ASYNC_CLASS, ALL_METHOD, |_, args| all(args));
    vm.register_native(ASYNC_CLASS, MAP_METHOD, map);

    vm.register_native(RUNTIME_CLASS, CLASS_MONITOR_METHOD, |vm, args| match arg(&args, 0)? {
        Value::Str(class) => Ok(Value::Object(vm.class_monitor(class))),
        other => Err(VmError::TypeError {
            expected: "class name",
            found: other.class_name().to_string(),
        }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_bytecode::{MethodRef, Signature, Type};

    fn call(vm: &Vm, owner: &str, name: &str, args: Vec<Value>) -> VmResult<Value> {
        let native = vm.native(owner, name).expect("native registered");
        native(vm, args)
    }

    #[test]
    fn test_class_monitor_is_shared() {
        let vm = Vm::new();
        let name = || vec![Value::str("demo.Main")];
        let a = call(&vm, RUNTIME_CLASS, CLASS_MONITOR_METHOD, name()).unwrap();
        let b = call(&vm, RUNTIME_CLASS, CLASS_MONITOR_METHOD, name()).unwrap();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(a.as_object().unwrap(), &vm.class_monitor("demo.Main")));
        assert!(call(&vm, RUNTIME_CLASS, CLASS_MONITOR_METHOD, vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_get() {
        let vm = Vm::new();
        let done = Value::Future(Future::completed(Value::Int(3)));
        assert_eq!(call(&vm, FUTURES_CLASS, GET_METHOD, vec![done]), Ok(Value::Int(3)));

        let failed = Value::Future(Future::failed(Value::str("bad")));
        assert_eq!(
            call(&vm, FUTURES_CLASS, GET_METHOD, vec![failed]),
            Err(VmError::Thrown(Value::str("bad")))
        );

        let pending = Value::Future(Future::pending());
        assert_eq!(call(&vm, FUTURES_CLASS, GET_METHOD, vec![pending]), Err(VmError::NotDone));
    }

    #[test]
    fn test_compose_chains_inner_future() {
        let vm = Vm::new();
        let inner = Future::pending();
        let inner_handle = inner.clone();
        vm.register_native("demo.K", "next", move |_, args| {
            assert!(args[0].as_future().unwrap().is_done());
            Ok(Value::Future(inner_handle.clone()))
        });

        let source = Future::pending();
        let closure = Closure {
            method: MethodRef::new(
                "demo.K",
                "next",
                Signature::new(vec![Type::object("rewind.Future")], Type::object("rewind.Future")),
            ),
            captured: vec![],
        };
        let composed = call(
            &vm,
            FUTURES_CLASS,
            COMPOSE_METHOD,
            vec![Value::Future(source.clone()), Value::Closure(Arc::new(closure))],
        )
        .unwrap();
        let composed = composed.as_future().unwrap().clone();
        assert_eq!(vm.stats().completions_registered(), 1);

        source.complete(Value::Null);
        assert!(!composed.is_done());
        inner.complete(Value::Int(11));
        assert_eq!(composed.outcome(), Some(Outcome::Completed(Value::Int(11))));
    }

    #[test]
    fn test_all_fails_on_first_failure() {
        let vm = Vm::new();
        let a = Future::pending();
        let b = Future::pending();
        let joined = call(
            &vm,
            FUTURES_CLASS,
            ALL_METHOD,
            vec![Value::Future(a.clone()), Value::Future(b.clone())],
        )
        .unwrap();
        let joined = joined.as_future().unwrap().clone();

        a.complete(Value::Int(1));
        assert!(!joined.is_done());
        b.fail(Value::str("no"));
        assert_eq!(joined.outcome(), Some(Outcome::Failed(Value::str("no"))));
    }

    #[test]
    fn test_await_blocks_until_settled() {
        let vm = Vm::new();
        let fut = Future::pending();
        let other = fut.clone();
        let value = crossbeam::thread::scope(|s| {
            let waiter = s.spawn(|_| call(&vm, ASYNC_CLASS, AWAIT_METHOD, vec![Value::Future(fut.clone())]));
            other.complete(Value::Long(5));
            waiter.join().unwrap()
        })
        .unwrap();
        assert_eq!(value, Ok(Value::Long(5)));
    }
}
