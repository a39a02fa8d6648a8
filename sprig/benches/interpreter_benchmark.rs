//! Run with:
//!   cargo bench --bench interpreter_benchmark
//!
//! `countdown` stays on the small integer fast paths, `fib` adds a cached
//! method send per call on top of them.

use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use sprig::{
    BytecodeWriter, DefaultRuntime, ExecutionResult, Opcode, Process, ProcessCreateInfo,
    ProgramBuilder, ProgramCreateInfo, Value, interpret,
};

fn countdown(builder: &mut ProgramBuilder, from: i64) -> Value {
    let minus = builder.selector("-", 1);
    let greater = builder.selector(">", 1);
    let mut w = BytecodeWriter::new();
    w.load_literal(from);
    let head = w.position();
    w.load_local(0);
    w.load_literal(1);
    w.invoke(Opcode::InvokeSubUnfold, minus);
    w.store_local(1);
    w.op(Opcode::Pop);
    w.load_local(0);
    w.load_literal(0);
    w.invoke(Opcode::InvokeGtUnfold, greater);
    w.branch_back_if_true(head);
    w.op(Opcode::Return);
    let code = w.finish().expect("countdown assembles");
    builder.function("countdown", 0, code)
}

fn fib(builder: &mut ProgramBuilder, n: i64) -> Value {
    let fib = builder.selector("fib", 0);
    let plus = builder.selector("+", 1);
    let minus = builder.selector("-", 1);
    let less = builder.selector("<", 1);

    let mut w = BytecodeWriter::new();
    w.load_local(4);
    w.load_literal(2);
    w.invoke(Opcode::InvokeLtUnfold, less);
    let recurse = w.branch_if_false();
    w.load_local(4);
    w.op(Opcode::Return);
    w.bind(recurse);
    w.load_local(4);
    w.load_literal(1);
    w.invoke(Opcode::InvokeSubUnfold, minus);
    w.invoke(Opcode::InvokeMethodUnfold, fib);
    w.load_local(5);
    w.load_literal(2);
    w.invoke(Opcode::InvokeSubUnfold, minus);
    w.invoke(Opcode::InvokeMethodUnfold, fib);
    w.invoke(Opcode::InvokeAddUnfold, plus);
    w.op(Opcode::Return);
    let body = w.finish().expect("fib assembles");
    let body = builder.function("Smi.fib", 1, body);
    let smi = builder.specials().smi_class;
    builder.define_method(smi, fib, body).expect("Smi accepts fib");

    let mut w = BytecodeWriter::new();
    w.load_literal(n);
    w.invoke(Opcode::InvokeMethodUnfold, fib);
    w.op(Opcode::Return);
    builder.function("main", 0, w.finish().expect("main assembles"))
}

fn setup(build: impl FnOnce(&mut ProgramBuilder) -> Value) -> (Process, Value) {
    let mut builder = ProgramBuilder::new(ProgramCreateInfo::default()).expect("bootstrap");
    let entry = build(&mut builder);
    let program = Arc::new(builder.finish().expect("program builds"));
    let process =
        Process::new(program, &ProcessCreateInfo::default()).expect("process allocates");
    (process, entry)
}

fn run(process: &mut Process, entry: Value) -> Value {
    process.setup_entry(entry, &[]).expect("entry frame");
    match interpret(process, &mut DefaultRuntime).expect("interpreter runs") {
        ExecutionResult::Normal(value) => value,
        other => panic!("unexpected {other:?}"),
    }
}

fn bench_countdown(c: &mut Criterion) {
    let (mut process, entry) = setup(|builder| countdown(builder, 100_000));
    c.bench_function("countdown 100k", |b| {
        b.iter(|| black_box(run(&mut process, black_box(entry))))
    });
}

fn bench_fib(c: &mut Criterion) {
    let (mut process, entry) = setup(|builder| fib(builder, 20));
    c.bench_function("fib 20", |b| {
        b.iter(|| black_box(run(&mut process, black_box(entry))))
    });
}

criterion_group!(benches, bench_countdown, bench_fib);
criterion_main!(benches);
