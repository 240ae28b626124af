use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gdbind_core::{CallFrame, Runtime, RuntimeOptions};
use gdbind_sdk::mock::MockHost;
use gdbind_sdk::{InitLevel, Vector3};

fn runtime() -> (Arc<MockHost>, Arc<Runtime>) {
    let host = Arc::new(MockHost::new());
    let runtime = Runtime::new(host.clone(), RuntimeOptions::default()).unwrap();
    runtime.initialize(InitLevel::Scene).unwrap();
    (host, runtime)
}

fn bench_push(c: &mut Criterion) {
    let (_host, runtime) = runtime();
    let mut group = c.benchmark_group("push");

    for count in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("i64", count), &count, |b, &count| {
            let scope = runtime.scope();
            b.iter(|| {
                let mut frame = CallFrame::new(&scope);
                for i in 0..count {
                    frame.push(black_box(i as i64)).unwrap();
                }
                frame.size_bytes()
            });
        });
    }

    group.bench_function("vector3", |b| {
        let scope = runtime.scope();
        b.iter(|| {
            let mut frame = CallFrame::new(&scope);
            frame.push(black_box(Vector3::new(1.0, 2.0, 3.0))).unwrap();
            frame.size_bytes()
        });
    });

    group.finish();
}

fn bench_ptrcall(c: &mut Criterion) {
    let (host, runtime) = runtime();
    host.define_method("Node", "add", 1, 2, |call| {
        let sum = call.arg::<i64>(0) + call.arg::<i64>(1);
        call.ret(sum);
    });
    host.define_method("Node", "echo", 2, 1, |call| {
        let text = call.arg_text(0).unwrap_or_default();
        call.ret_text(&text);
    });
    let add = runtime.method_bind("Node", "add", 1).unwrap();
    let echo = runtime.method_bind("Node", "echo", 2).unwrap();

    c.bench_function("ptrcall_pod", |b| {
        let scope = runtime.scope();
        b.iter(|| {
            let mut frame = CallFrame::new(&scope);
            frame.push(black_box(20i64)).unwrap().push(black_box(22i64)).unwrap();
            unsafe { frame.ptrcall(add, None) };
            frame.ret::<i64>().unwrap()
        });
    });

    c.bench_function("ptrcall_string", |b| {
        b.iter(|| {
            let scope = runtime.scope();
            let mut frame = CallFrame::new(&scope);
            frame.push(black_box("hello")).unwrap();
            unsafe { frame.ptrcall(echo, None) };
            frame.ret::<String>().unwrap()
        });
    });

    c.bench_function("method_bind_cached", |b| {
        b.iter(|| runtime.method_bind(black_box("Node"), "add", 1).unwrap());
    });
}

criterion_group!(benches, bench_push, bench_ptrcall);
criterion_main!(benches);
