use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rewind_bytecode::names::ASYNC_CLASS;
use rewind_bytecode::{ClassFile, CompiledMethod, MethodBuilder, Signature, Type, ValueKind};
use rewind_engine::transform::NameCounter;
use rewind_engine::{AsyncTransformer, TransformOptions};
use std::sync::Arc;

fn future() -> Type {
    Type::object("rewind.Future")
}

/// A method awaiting its argument `awaits` times, keeping a running long sum
/// and an int counter live across every suspension point
fn chain(awaits: usize) -> CompiledMethod {
    let await_sig = Signature::new(vec![future()], Type::object("rewind.Object"));
    let mut b = MethodBuilder::new("chain", Signature::new(vec![future()], future()), true);
    b.lconst(0).store(ValueKind::Long, 1).iconst(0).store(ValueKind::Int, 3);
    for i in 0..awaits {
        b.line(i as u32 + 1)
            .load(ValueKind::Long, 1)
            .lconst(i as i64)
            .add(ValueKind::Long)
            .store(ValueKind::Long, 1)
            .load(ValueKind::Int, 3)
            .load(ValueKind::Ref, 0)
            .invoke_static(ASYNC_CLASS, "await", await_sig.clone())
            .pop()
            .iconst(1)
            .add(ValueKind::Int)
            .store(ValueKind::Int, 3);
    }
    b.load(ValueKind::Ref, 0).ret(Some(ValueKind::Ref));
    b.finish().expect("valid benchmark method")
}

fn bench_transform_method(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform_method");
    for awaits in [1usize, 8, 64] {
        let method = chain(awaits);
        let transformer = AsyncTransformer::new(TransformOptions::default())
            .with_names(Arc::new(NameCounter::new()));
        group.bench_with_input(BenchmarkId::new("awaits", awaits), &method, |b, method| {
            b.iter(|| transformer.transform_method("bench.Chain", black_box(method)).unwrap());
        });
    }
    group.finish();
}

fn bench_transform_class(c: &mut Criterion) {
    let mut class = ClassFile::new("bench.Chain");
    for i in 0..16 {
        let mut method = chain(4);
        method.name = format!("chain{}", i);
        class.methods.push(method);
    }

    c.bench_function("transform_class_16x4", |b| {
        b.iter(|| {
            let mut copy = class.clone();
            AsyncTransformer::new(TransformOptions::default())
                .with_names(Arc::new(NameCounter::new()))
                .transform_class(black_box(&mut copy))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_transform_method, bench_transform_class);
criterion_main!(benches);
