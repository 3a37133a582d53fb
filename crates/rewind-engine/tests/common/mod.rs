//! Shared fixtures: sample async methods, library natives and helpers

#![allow(dead_code)]

use rewind_bytecode::names::{ASYNC_CLASS, CONSTRUCTOR, FUTURES_CLASS, OBJECT_CLASS};
use rewind_bytecode::{ClassFile, CompiledMethod, Cond, MethodBuilder, Signature, Type, ValueKind};
use rewind_engine::transform::NameCounter;
use rewind_engine::vm::Outcome;
use rewind_engine::{AsyncTransformer, Future, TransformOptions, Value, Vm};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const MAIN: &str = "demo.Main";
pub const LIB: &str = "demo.Lib";
pub const BOX: &str = "demo.Box";
pub const PROBE: &str = "demo.Probe";

pub fn future() -> Type {
    Type::object("rewind.Future")
}

pub fn object() -> Type {
    Type::object(OBJECT_CLASS)
}

pub fn sig(params: Vec<Type>, ret: Type) -> Signature {
    Signature::new(params, ret)
}

pub fn await_sig() -> Signature {
    sig(vec![future()], object())
}

pub fn transformer() -> AsyncTransformer {
    AsyncTransformer::new(TransformOptions::default()).with_names(Arc::new(NameCounter::new()))
}

/// Transformed copy of `class`
pub fn transformed(class: &ClassFile) -> ClassFile {
    let mut out = class.clone();
    transformer().transform_class(&mut out).unwrap();
    out
}

/// `compute1(x) = 10x`, `compute2() = 5`, `boxLong(v)` = completed future of `v`
pub fn install_lib(vm: &Vm) {
    vm.register_native(LIB, "compute1", |_, args| Ok(Value::Long(i64::from(args[0].as_int()?) * 10)));
    vm.register_native(LIB, "compute2", |_, _| Ok(Value::Long(5)));
    vm.register_native(LIB, "boxLong", |_, args| Ok(Value::Future(Future::completed(args[0].clone()))));
}

/// VM with the library natives and `class` loaded
pub fn vm_with(class: &ClassFile) -> Vm {
    let vm = Vm::new();
    install_lib(&vm);
    vm.load_class(&box_class()).unwrap();
    vm.load_class(class).unwrap();
    vm
}

pub fn outcome(value: &Value) -> Option<Outcome> {
    value.as_future().unwrap().outcome()
}

/// `f(int x, Future p) = { long a = compute1(x); await(p); return boxLong(a + compute2()); }`
pub fn suspend_resume() -> CompiledMethod {
    let mut b = MethodBuilder::new("f", sig(vec![Type::Int, future()], future()), true);
    b.line(10)
        .load(ValueKind::Int, 0)
        .invoke_static(LIB, "compute1", sig(vec![Type::Int], Type::Long))
        .store(ValueKind::Long, 2)
        .line(11)
        .load(ValueKind::Ref, 1)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .line(12)
        .load(ValueKind::Long, 2)
        .invoke_static(LIB, "compute2", sig(vec![], Type::Long))
        .add(ValueKind::Long)
        .invoke_static(LIB, "boxLong", sig(vec![Type::Long], future()))
        .ret(Some(ValueKind::Ref));
    b.finish().unwrap()
}

/// `g(Future p, Future q)`: two suspension points with a long live across both
pub fn two_awaits() -> CompiledMethod {
    let mut b = MethodBuilder::new("g", sig(vec![future(), future()], future()), true);
    b.line(20)
        .iconst(4)
        .invoke_static(LIB, "compute1", sig(vec![Type::Int], Type::Long))
        .store(ValueKind::Long, 2)
        .load(ValueKind::Ref, 0)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .line(21)
        .load(ValueKind::Long, 2)
        .load(ValueKind::Ref, 1)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .invoke_static(LIB, "compute2", sig(vec![], Type::Long))
        .add(ValueKind::Long)
        .invoke_static(LIB, "boxLong", sig(vec![Type::Long], future()))
        .ret(Some(ValueKind::Ref));
    b.finish().unwrap()
}

/// `h(int flag, Object ex, Future p)`: throws `ex` before suspending when `flag != 0`
pub fn throws_early() -> CompiledMethod {
    let mut b = MethodBuilder::new("h", sig(vec![Type::Int, object(), future()], future()), true);
    let skip = b.new_label();
    b.line(30)
        .load(ValueKind::Int, 0)
        .if_cond(Cond::Eq, skip)
        .load(ValueKind::Ref, 1)
        .throw()
        .label(skip)
        .line(31)
        .load(ValueKind::Ref, 2)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .load(ValueKind::Ref, 2)
        .ret(Some(ValueKind::Ref));
    b.finish().unwrap()
}

/// `i(Object ex, Future p) = { await(p); throw ex; }`
pub fn throws_late() -> CompiledMethod {
    let mut b = MethodBuilder::new("i", sig(vec![object(), future()], future()), true);
    b.line(40)
        .load(ValueKind::Ref, 1)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop()
        .load(ValueKind::Ref, 0)
        .throw();
    b.finish().unwrap()
}

/// `make(Future p) = completed(new Box(await(p)))`
pub fn construct_after_await() -> CompiledMethod {
    let mut b = MethodBuilder::new("make", sig(vec![future()], future()), true);
    b.line(50)
        .new_object(BOX)
        .dup()
        .load(ValueKind::Ref, 0)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .invoke_constructor(BOX, vec![object()])
        .invoke_static(FUTURES_CLASS, "completed", sig(vec![object()], future()))
        .ret(Some(ValueKind::Ref));
    b.finish().unwrap()
}

/// `critical(Lock lock, Future p)`: enters the probe under `lock` on both
/// sides of a suspension point
pub fn critical_section() -> CompiledMethod {
    let probe = |b: &mut MethodBuilder| {
        b.invoke_static(PROBE, "enter", sig(vec![], Type::Void))
            .invoke_static(PROBE, "exit", sig(vec![], Type::Void));
    };
    let mut b = MethodBuilder::new(
        "critical",
        sig(vec![Type::object("demo.Lock"), future()], future()),
        true,
    );
    b.line(60).load(ValueKind::Ref, 0).monitor_enter();
    probe(&mut b);
    b.line(61)
        .load(ValueKind::Ref, 1)
        .invoke_static(ASYNC_CLASS, "await", await_sig())
        .pop();
    probe(&mut b);
    b.line(62)
        .load(ValueKind::Ref, 0)
        .monitor_exit()
        .load(ValueKind::Ref, 1)
        .ret(Some(ValueKind::Ref));
    b.finish().unwrap()
}

/// `demo.Box` with a single-field constructor
pub fn box_class() -> ClassFile {
    let mut ctor = MethodBuilder::new(CONSTRUCTOR, sig(vec![object()], Type::Void), false);
    ctor.load(ValueKind::Ref, 0)
        .load(ValueKind::Ref, 1)
        .put_field(BOX, "value", object())
        .ret(None);
    let mut class = ClassFile::new(BOX);
    class.methods.push(ctor.finish().unwrap());
    class
}

pub fn main_class(methods: Vec<CompiledMethod>) -> ClassFile {
    let mut class = ClassFile::new(MAIN);
    class.methods = methods;
    class
}

/// Counts threads inside the critical section
#[derive(Default)]
pub struct Probe {
    pub inside: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub entries: AtomicUsize,
}

impl Probe {
    pub fn install(vm: &Vm) -> Arc<Probe> {
        let probe = Arc::new(Probe::default());
        let p = Arc::clone(&probe);
        vm.register_native(PROBE, "enter", move |_, _| {
            if p.inside.fetch_add(1, Ordering::SeqCst) != 0 {
                p.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            p.entries.fetch_add(1, Ordering::SeqCst);
            std::thread::yield_now();
            Ok(Value::Null)
        });
        let p = Arc::clone(&probe);
        vm.register_native(PROBE, "exit", move |_, _| {
            p.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        probe
    }
}
