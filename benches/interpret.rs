//! Interpreter throughput microbenchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use siskin::{Config, Vm};

const FIB: &str = "\
var fib = Fn.new {|n|
  if (n < 2) return n
  return fib.call(n - 1) + fib.call(n - 2)
}
fib.call(15)
";

const SEQUENCE_PIPELINE: &str = "\
var total = (1..200).map {|x| x * x }.where {|x| x % 2 == 0 }.reduce(0) {|a, b| a + b }
";

fn bench_fib(c: &mut Criterion) {
    c.bench_function("fib_15", |b| {
        b.iter(|| {
            let mut vm = Vm::new(Config::default());
            black_box(vm.interpret("bench", FIB))
        })
    });
}

fn bench_sequence_pipeline(c: &mut Criterion) {
    c.bench_function("sequence_pipeline", |b| {
        b.iter(|| {
            let mut vm = Vm::new(Config::default());
            black_box(vm.interpret("bench", SEQUENCE_PIPELINE))
        })
    });
}

fn bench_bootstrap(c: &mut Criterion) {
    c.bench_function("vm_bootstrap", |b| {
        b.iter(|| black_box(Vm::new(Config::default())))
    });
}

criterion_group!(benches, bench_fib, bench_sequence_pipeline, bench_bootstrap);
criterion_main!(benches);
