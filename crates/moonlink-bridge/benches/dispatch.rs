//! Dispatch hot-path benchmarks
//!
//! Measures the cost of crossing from Lua into the host through each proxy
//! kind, and of the FFI ctype lookup.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use moonlink_bridge::{BridgeResult, CallContext, HostObject, Instance, reflect};

struct Fixed;

impl HostObject for Fixed {
    fn get(&self, _field: &str, ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
        ctx.push_integer(7);
        Ok(1)
    }
}

fn identity(ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
    let n = ctx.arg_number(1)?;
    ctx.push_number(n);
    Ok(1)
}

fn bench_host_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_calls");
    let instance = Instance::new().expect("instance");
    instance.set_global_function("closure", identity).expect("closure");
    instance.set_global_callable("bare", identity).expect("bare");
    instance.set_global_object("obj", Fixed).expect("object");

    group.bench_function("closure_1000", |b| {
        b.iter(|| {
            instance
                .eval(black_box("local s = 0 for i = 1, 1000 do s = s + closure(i) end return s"))
                .expect("eval")
        });
    });

    group.bench_function("callable_1000", |b| {
        b.iter(|| {
            instance
                .eval(black_box("local s = 0 for i = 1, 1000 do s = s + bare(i) end return s"))
                .expect("eval")
        });
    });

    group.bench_function("field_read_1000", |b| {
        b.iter(|| {
            instance
                .eval(black_box("local s = 0 for i = 1, 1000 do s = s + obj.x end return s"))
                .expect("eval")
        });
    });

    group.finish();
}

fn bench_reflection(c: &mut Criterion) {
    let instance = Instance::new().expect("instance");
    let state = instance.state();
    reflect::push_int64(state, 42).expect("int64 literal");
    state.push_number(1.5);

    c.bench_function("ctype_of_cdata", |b| {
        b.iter(|| black_box(reflect::ctype_of(state, black_box(-2))));
    });
    c.bench_function("ctype_of_number", |b| {
        b.iter(|| black_box(reflect::ctype_of(state, black_box(-1))));
    });
}

criterion_group!(benches, bench_host_calls, bench_reflection);
criterion_main!(benches);
