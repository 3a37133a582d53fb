//! Running transformed code on the reference VM

mod common;

use common::*;
use parking_lot::Mutex;
use rewind_bytecode::names::{ASYNC_CLASS, AWAITABLE_CLASS, FUTURES_CLASS};
use rewind_bytecode::{CompiledMethod, Cond, MethodBuilder, MethodRef, Type, ValueKind};
use rewind_engine::vm::Outcome;
use rewind_engine::{Future, Value};
use std::sync::Arc;

fn run(vm: &rewind_engine::Vm, name: &str, args: Vec<Value>) -> Value {
    vm.invoke_static(MAIN, name, args).unwrap()
}

// ============================================================================
// Synchronous path
// ============================================================================

#[test]
fn test_completed_futures_match_untransformed_result() {
    let original = main_class(vec![suspend_resume(), two_awaits()]);
    let plain = vm_with(&original);
    let lowered = vm_with(&transformed(&original));

    for x in [0, 3, -7] {
        let args = || vec![Value::Int(x), Value::Future(Future::completed(Value::Null))];
        let expected = outcome(&run(&plain, "f", args()));
        let actual = outcome(&run(&lowered, "f", args()));
        assert_eq!(actual, expected);
        assert_eq!(actual, Some(Outcome::Completed(Value::Long(i64::from(x) * 10 + 5))));
    }

    let done = || Value::Future(Future::completed(Value::Int(1)));
    let expected = outcome(&run(&plain, "g", vec![done(), done()]));
    assert_eq!(outcome(&run(&lowered, "g", vec![done(), done()])), expected);

    assert_eq!(lowered.stats().closures_created(), 0);
    assert_eq!(lowered.stats().completions_registered(), 0);
}

// ============================================================================
// Suspension and resumption
// ============================================================================

#[test]
fn test_suspend_then_resume() {
    let vm = vm_with(&transformed(&main_class(vec![suspend_resume()])));
    let p = Future::pending();

    let result = run(&vm, "f", vec![Value::Int(3), Value::Future(p.clone())]);
    assert_eq!(outcome(&result), None);
    assert_eq!(vm.stats().closures_created(), 1);
    assert_eq!(vm.stats().completions_registered(), 1);

    p.complete(Value::Null);
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Long(35))));
}

#[test]
fn test_long_on_the_operand_stack_survives_two_suspensions() {
    let vm = vm_with(&transformed(&main_class(vec![two_awaits()])));
    let p = Future::pending();
    let q = Future::pending();

    let result = run(&vm, "g", vec![Value::Future(p.clone()), Value::Future(q.clone())]);
    p.complete(Value::Null);
    assert_eq!(outcome(&result), None);
    q.complete(Value::Null);
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Long(45))));
}

#[test]
fn test_second_suspension_skipped_when_already_done() {
    let vm = vm_with(&transformed(&main_class(vec![two_awaits()])));
    let p = Future::pending();
    let q = Future::completed(Value::Null);

    let result = run(&vm, "g", vec![Value::Future(p.clone()), Value::Future(q)]);
    p.complete(Value::Null);
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Long(45))));
    assert_eq!(vm.stats().closures_created(), 1);
}

#[test]
fn test_resumes_on_the_completing_thread() {
    let vm = vm_with(&transformed(&main_class(vec![suspend_resume()])));
    let p = Future::pending();
    let result = run(&vm, "f", vec![Value::Int(1), Value::Future(p.clone())]);

    std::thread::spawn(move || p.complete(Value::Null)).join().unwrap();
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Long(15))));
}

// ============================================================================
// Exceptions
// ============================================================================

#[test]
fn test_throw_before_suspension_rejects_with_same_object() {
    let vm = vm_with(&transformed(&main_class(vec![throws_early()])));
    let ex = vm.new_object("demo.Oops");

    let result = run(
        &vm,
        "h",
        vec![Value::Int(1), ex.clone(), Value::Future(Future::pending())],
    );
    match outcome(&result) {
        Some(Outcome::Failed(thrown)) => assert_eq!(thrown, ex),
        other => panic!("expected a rejected future, got {:?}", other),
    }
}

#[test]
fn test_no_throw_takes_the_await_path() {
    let vm = vm_with(&transformed(&main_class(vec![throws_early()])));
    let p = Future::pending();
    let result = run(
        &vm,
        "h",
        vec![Value::Int(0), vm.new_object("demo.Oops"), Value::Future(p.clone())],
    );
    assert_eq!(outcome(&result), None);
    p.complete(Value::Int(8));
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Int(8))));
}

#[test]
fn test_throw_after_resume_rejects_composed_future() {
    let vm = vm_with(&transformed(&main_class(vec![throws_late()])));
    let ex = vm.new_object("demo.Oops");
    let p = Future::pending();

    let result = run(&vm, "i", vec![ex.clone(), Value::Future(p.clone())]);
    assert_eq!(outcome(&result), None);
    p.complete(Value::Null);
    assert_eq!(outcome(&result), Some(Outcome::Failed(ex)));
}

#[test]
fn test_failed_future_rethrows_at_resume() {
    let vm = vm_with(&transformed(&main_class(vec![suspend_resume()])));
    let p = Future::pending();
    let result = run(&vm, "f", vec![Value::Int(2), Value::Future(p.clone())]);

    p.fail(Value::str("upstream"));
    assert_eq!(outcome(&result), Some(Outcome::Failed(Value::str("upstream"))));
}

// ============================================================================
// Deferred construction
// ============================================================================

#[test]
fn test_constructs_after_suspension() {
    let original = main_class(vec![construct_after_await()]);
    let vm = vm_with(&transformed(&original));
    let p = Future::pending();

    let result = run(&vm, "make", vec![Value::Future(p.clone())]);
    assert_eq!(outcome(&result), None);
    p.complete(Value::str("payload"));

    let Some(Outcome::Completed(boxed)) = outcome(&result) else {
        panic!("expected a completed future");
    };
    let obj = boxed.as_object().unwrap();
    assert_eq!(obj.class(), BOX);
    assert_eq!(obj.get_field("value"), Some(Value::str("payload")));
}

#[test]
fn test_deferred_construction_matches_untransformed() {
    let original = main_class(vec![construct_after_await()]);
    let plain = vm_with(&original);
    let lowered = vm_with(&transformed(&original));

    let field = |vm: &rewind_engine::Vm| {
        let result = run(vm, "make", vec![Value::Future(Future::completed(Value::Int(6)))]);
        match outcome(&result) {
            Some(Outcome::Completed(boxed)) => boxed.as_object().unwrap().get_field("value"),
            other => panic!("unexpected outcome {:?}", other),
        }
    };
    assert_eq!(field(&lowered), field(&plain));
    assert_eq!(lowered.stats().objects_allocated(), 1);
}

// ============================================================================
// Handlers and monitors around a suspension point
// ============================================================================

/// `guarded(Future p) = try { completed(await(p)) } catch (any) { completed("recovered") }`
fn guarded() -> CompiledMethod {
    let completed = sig(vec![object()], future());
    let mut b = MethodBuilder::new("guarded", sig(vec![future()], future()), true);
    let (start, end, handler) = (b.new_label(), b.new_label(), b.new_label());
    b.line(90)
        .label(start)
        .load(ValueKind::Ref, 0)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .store(ValueKind::Ref, 1)
        .label(end)
        .load(ValueKind::Ref, 1)
        .invoke_static(FUTURES_CLASS, "completed", completed.clone())
        .ret(Some(ValueKind::Ref))
        .label(handler)
        .line(91)
        .pop()
        .sconst("recovered")
        .invoke_static(FUTURES_CLASS, "completed", completed)
        .ret(Some(ValueKind::Ref))
        .handler(start, end, handler, None);
    b.finish().unwrap()
}

#[test]
fn test_handler_runs_when_future_fails_after_suspension() {
    let vm = vm_with(&transformed(&main_class(vec![guarded()])));

    let p = Future::pending();
    let result = run(&vm, "guarded", vec![Value::Future(p.clone())]);
    assert_eq!(outcome(&result), None);
    p.fail(Value::str("upstream"));
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::str("recovered"))));

    let p = Future::pending();
    let result = run(&vm, "guarded", vec![Value::Future(p.clone())]);
    p.complete(Value::Int(4));
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Int(4))));

    // already failed: the handler runs on the fast path
    let result = run(&vm, "guarded", vec![Value::Future(Future::failed(Value::str("early")))]);
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::str("recovered"))));
}

/// `locked(Lock lock, Future p)` in the shape compilers emit for a
/// synchronized block: `dup; store; monitorenter`, then a catch-all that
/// releases the lock and rethrows
fn synchronized_block() -> CompiledMethod {
    let params = vec![Type::object("demo.Lock"), future()];
    let mut b = MethodBuilder::new("locked", sig(params, future()), true);
    let (start, end, handler) = (b.new_label(), b.new_label(), b.new_label());
    b.line(100)
        .load(ValueKind::Ref, 0)
        .dup()
        .store(ValueKind::Ref, 2)
        .monitor_enter()
        .label(start)
        .line(101)
        .load(ValueKind::Ref, 1)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .label(end)
        .load(ValueKind::Ref, 2)
        .monitor_exit()
        .load(ValueKind::Ref, 1)
        .ret(Some(ValueKind::Ref))
        .label(handler)
        .load(ValueKind::Ref, 2)
        .monitor_exit()
        .throw()
        .handler(start, end, handler, None);
    b.finish().unwrap()
}

#[test]
fn test_synchronized_block_releases_lock_on_both_resume_paths() {
    let vm = vm_with(&transformed(&main_class(vec![synchronized_block()])));
    let lock = vm.new_object("demo.Lock");
    let monitor = || lock.as_object().unwrap().monitor().hold_count();

    let p = Future::pending();
    let result = run(&vm, "locked", vec![lock.clone(), Value::Future(p.clone())]);
    assert_eq!(monitor(), 0);
    p.complete(Value::Int(1));
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Int(1))));
    assert_eq!(monitor(), 0);

    let p = Future::pending();
    let result = run(&vm, "locked", vec![lock.clone(), Value::Future(p.clone())]);
    p.fail(Value::str("upstream"));
    assert_eq!(outcome(&result), Some(Outcome::Failed(Value::str("upstream"))));
    assert_eq!(monitor(), 0);
}

// ============================================================================
// Loops and closures
// ============================================================================

/// `count(int n) = { long sum = 0; for (int i = 0; i < n; i++) { await(step(i)); sum += i; } return boxLong(sum); }`
fn await_in_loop() -> CompiledMethod {
    let mut b = MethodBuilder::new("count", sig(vec![Type::Int], future()), true);
    let (head, done) = (b.new_label(), b.new_label());
    b.line(110)
        .lconst(0)
        .store(ValueKind::Long, 2)
        .iconst(0)
        .store(ValueKind::Int, 1)
        .label(head)
        .load(ValueKind::Int, 1)
        .load(ValueKind::Int, 0)
        .if_cmp(Cond::Ge, done)
        .line(111)
        .load(ValueKind::Int, 1)
        .invoke_static(LIB, "step", sig(vec![Type::Int], future()))
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .load(ValueKind::Long, 2)
        .load(ValueKind::Int, 1)
        .convert(ValueKind::Int, ValueKind::Long)
        .add(ValueKind::Long)
        .store(ValueKind::Long, 2)
        .load(ValueKind::Int, 1)
        .iconst(1)
        .add(ValueKind::Int)
        .store(ValueKind::Int, 1)
        .jump(head)
        .label(done)
        .line(112)
        .load(ValueKind::Long, 2)
        .invoke_static(LIB, "boxLong", sig(vec![Type::Long], future()))
        .ret(Some(ValueKind::Ref));
    b.finish().unwrap()
}

#[test]
fn test_await_inside_loop_resumes_each_iteration() {
    let vm = vm_with(&transformed(&main_class(vec![await_in_loop()])));
    let steps = Arc::new(Mutex::new(Vec::new()));
    let issued = Arc::clone(&steps);
    vm.register_native(LIB, "step", move |_, _| {
        let p = Future::pending();
        issued.lock().push(p.clone());
        Ok(Value::Future(p))
    });

    let result = run(&vm, "count", vec![Value::Int(4)]);
    for i in 0..4 {
        assert_eq!(outcome(&result), None);
        let step = steps.lock()[i].clone();
        step.complete(Value::Null);
    }
    assert_eq!(steps.lock().len(), 4);
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::Long(6))));
    assert_eq!(vm.stats().completions_registered(), 4);

    let empty = run(&vm, "count", vec![Value::Int(0)]);
    assert_eq!(outcome(&empty), Some(Outcome::Completed(Value::Long(0))));
}

#[test]
fn test_lambda_returning_the_marker_is_transformed() {
    let marker = Type::object(AWAITABLE_CLASS);

    // lambda$0(Future p) = completed(await(p))
    let mut lambda = MethodBuilder::new("lambda$0", sig(vec![future()], marker.clone()), true);
    lambda
        .line(120)
        .load(ValueKind::Ref, 0)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .invoke_static(FUTURES_CLASS, "completed", sig(vec![object()], future()))
        .ret(Some(ValueKind::Ref));
    lambda.synthetic();

    // apply(Future p) = (() -> lambda$0(p)).call()
    let target = MethodRef::new(MAIN, "lambda$0", sig(vec![future()], marker.clone()));
    let mut apply = MethodBuilder::new("apply", sig(vec![future()], future()), true);
    apply
        .line(121)
        .load(ValueKind::Ref, 0)
        .make_closure(target, 1)
        .invoke_closure(sig(vec![], marker))
        .ret(Some(ValueKind::Ref));

    let mut class = main_class(vec![apply.finish().unwrap(), lambda.finish().unwrap()]);
    let report = transformer().transform_class(&mut class).unwrap();
    assert_eq!(report.transformed, 2);
    assert_eq!(report.missing_closure_targets, 0);
    assert_eq!(report.continuations, vec!["lambda$0$async".to_string()]);

    let vm = vm_with(&class);
    let p = Future::pending();
    let result = run(&vm, "apply", vec![Value::Future(p.clone())]);
    assert_eq!(outcome(&result), None);
    p.complete(Value::str("done"));
    assert_eq!(outcome(&result), Some(Outcome::Completed(Value::str("done"))));
}
