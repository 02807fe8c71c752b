//! Call path benchmarks
//!
//! Measures the fixed cost runlink adds on top of a raw native call:
//! tag parsing, plan construction, marshaling and frame reuse.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use runlink::{Address, FnShape, ForeignFunction, FramePool, LibffiBackend, Tag, Value};
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::Arc;

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn length(text: *const c_char) -> usize {
    unsafe { CStr::from_ptr(text) }.to_bytes().len()
}

extern "C" fn mix(a: i64, b: f64, c: i8, d: u16, e: f32, f: i32) -> f64 {
    a as f64 + b + c as f64 + d as f64 + e as f64 + f as f64
}

fn pool() -> Arc<FramePool> {
    Arc::new(FramePool::new(Arc::new(LibffiBackend), 64, 4096, 8))
}

fn function(tag: &str, ptr: *const ()) -> ForeignFunction {
    let tag = Tag::parse(tag).unwrap();
    let address = Address::new(ptr as *mut c_void).unwrap();
    unsafe { ForeignFunction::new(&tag.names[0], address, tag.signature, None, pool()) }.unwrap()
}

// ============================================================================
// Tag Parsing
// ============================================================================

fn bench_tag_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("tag_parse");
    for tag in [
        "abs func(int)int",
        "puts func(#char)int<0;strerror",
        "fread func(&void[@3],size_t/@1,size_t,&FILE)size_t<@3; ferror(@4)",
        "snprintf func(&uchar[>=@2],size_t,#char...f@3)int",
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(tag), tag, |b, tag| {
            b.iter(|| Tag::parse(black_box(tag)).unwrap());
        });
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let tag = Tag::parse("puts func(#char)int<0;strerror").unwrap();
    c.bench_function("shape_infer_puts", |b| {
        b.iter(|| FnShape::infer(black_box(&tag.signature)).unwrap());
    });
}

// ============================================================================
// Calls
// ============================================================================

fn bench_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("call");

    let add = function("add func(int,int)int", add as *const ());
    let args = [Value::I32(20), Value::I32(22)];
    group.bench_function("scalar_2", |b| {
        b.iter(|| add.call(black_box(&args)).unwrap());
    });

    let mix = function(
        "mix func(int64_t,double,int8_t,uint16_t,float,int)double",
        mix as *const (),
    );
    let args = [
        Value::I64(1),
        Value::F64(2.0),
        Value::I8(3),
        Value::U16(4),
        Value::F32(5.0),
        Value::I32(6),
    ];
    group.bench_function("scalar_6_mixed", |b| {
        b.iter(|| mix.call(black_box(&args)).unwrap());
    });

    let length = function("length func(#char)size_t", length as *const ());
    let args = [Value::from("a string that has to be copied into C memory")];
    group.bench_function("string_in", |b| {
        b.iter(|| length.call(black_box(&args)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_tag_parse, bench_plan, bench_calls);
criterion_main!(benches);
