use std::{error::Error, sync::Arc};

use clap::{Parser, ValueEnum};
use log::info;
use sprig::{
    BytecodeWriter, Code, DefaultRuntime, ExecutionResult, HeapSettings, Opcode, Process,
    ProcessCreateInfo, ProgramBuilder, ProgramCreateInfo, Value, disassemble, interpret,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Demo {
    /// recursive fibonacci through a method on small integers
    Fib,
    /// counts down to zero in a backward-branch loop
    Countdown,
}

#[derive(Debug, Parser)]
#[command(version, about = "Runs a bytecode demo on the sprig interpreter")]
struct Args {
    #[arg(value_enum, default_value_t = Demo::Fib)]
    demo: Demo,

    /// Argument handed to the demo.
    #[arg(default_value_t = 25)]
    n: i32,

    /// Print the bytecode before running it.
    #[arg(long)]
    disassemble: bool,

    /// Initial stack size in slots.
    #[arg(long, default_value_t = 1024)]
    stack_size: usize,

    /// Live objects the heap admits before the first collection.
    #[arg(long, default_value_t = 4096)]
    heap_capacity: usize,
}

struct Demos {
    builder: ProgramBuilder,
    show: bool,
}

impl Demos {
    fn function(&mut self, name: &str, arity: usize, code: Code) -> Value {
        if self.show {
            println!("{name}:\n{}", disassemble(&code.bytecode));
        }
        self.builder.function(name, arity, code)
    }

    /// `fib` as a method on small integers plus an entry function calling it on `n`.
    fn fib(&mut self, n: i32) -> Result<Value, Box<dyn Error>> {
        let fib = self.builder.selector("fib", 0);
        let plus = self.builder.selector("+", 1);
        let minus = self.builder.selector("-", 1);
        let less = self.builder.selector("<", 1);

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
        let body = self.function("Smi.fib", 1, w.finish()?);
        let smi = self.builder.specials().smi_class;
        self.builder.define_method(smi, fib, body)?;

        let mut w = BytecodeWriter::new();
        w.load_literal(i64::from(n));
        w.invoke(Opcode::InvokeMethodUnfold, fib);
        w.op(Opcode::Return);
        Ok(self.function("main", 0, w.finish()?))
    }

    fn countdown(&mut self, n: i32) -> Result<Value, Box<dyn Error>> {
        let minus = self.builder.selector("-", 1);
        let greater = self.builder.selector(">", 1);

        let mut w = BytecodeWriter::new();
        w.load_literal(i64::from(n));
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
        Ok(self.function("main", 0, w.finish()?))
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut demos = Demos {
        builder: ProgramBuilder::new(ProgramCreateInfo::default())?,
        show: args.disassemble,
    };
    let main = match args.demo {
        Demo::Fib => demos.fib(args.n)?,
        Demo::Countdown => demos.countdown(args.n)?,
    };
    let program = Arc::new(demos.builder.finish()?);
    let info = ProcessCreateInfo {
        stack_size: args.stack_size,
        heap: HeapSettings {
            capacity: args.heap_capacity,
            ..HeapSettings::default()
        },
        ..ProcessCreateInfo::default()
    };
    let mut process = Process::new(program, &info).map_err(|failure| format!("{failure:?}"))?;
    process.setup_entry(main, &[])?;

    let mut runtime = DefaultRuntime;
    let result = loop {
        match interpret(&mut process, &mut runtime)? {
            ExecutionResult::Normal(value) => break value,
            ExecutionResult::Interrupt | ExecutionResult::Breakpoint => continue,
            ExecutionResult::Yield(value) | ExecutionResult::TargetYield(value) => {
                info!("yielded {value:?}")
            }
            ExecutionResult::UncaughtException => return Err("uncaught exception".into()),
        }
    };

    let (hits, misses) = process.lookup_cache.counters();
    info!("lookup cache: {hits} hits, {misses} misses");
    info!("heap: {:?}", process.heap.stats());
    match result.as_smi() {
        Some(value) => println!("{:?}({}) = {value}", args.demo, args.n),
        None => println!("{:?}({}) = {result:?}", args.demo, args.n),
    }
    Ok(())
}
