//! Criterion benchmarks for qlc-core.
//!
//! ## Benchmark groups
//!
//! 1. **parse** — tree-sitter parse plus lowering into the Program Model.
//! 2. **static_analysis** — fact extraction on an already-lowered program.
//! 3. **execution** — sandboxed runs, including a loop-heavy program.
//! 4. **generation** — the full `generate` pipeline per selection strategy.
//! 5. **guards** — clamp helpers.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/qlc-core/Cargo.toml
//! # Run only the generation group:
//! cargo bench --manifest-path crates/qlc-core/Cargo.toml -- generation
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use qlc_core::analysis::dynamic::{execute, ExecutionOptions, InputBindings};
use qlc_core::analysis::analyze_program;
use qlc_core::engine::guards::{clamp_question_limit, clamp_stack_depth, clamp_timeout_ms};
use qlc_core::engine::{GenerationConfig, QuestionEngine, Strategy};
use qlc_core::program::parse_program;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const SMALL: &str = "\
def factorial(n):
    if n <= 1:
        return 1
    return n * factorial(n - 1)

def fib(n):
    a, b = 0, 1
    for _ in range(n):
        a, b = b, a + b
    return a

print(factorial(6), fib(10))
";

const LOOPS: &str = "\
total = 0
for i in range(200):
    j = 0
    while j < 20:
        total += i * j
        j += 1
print(total)
";

/// A synthetic module with `count` small functions that call each other.
fn generated_module(count: usize) -> String {
    let mut source = String::new();
    for i in 0..count {
        source.push_str(&format!("def f{i}(x, y=1):\n"));
        source.push_str("    s = 0\n");
        source.push_str("    for k in range(x):\n");
        source.push_str("        if k % 2 == 0:\n");
        source.push_str("            s += k * y\n");
        if i > 0 {
            source.push_str(&format!("    return s + f{}(x - 1)\n\n", i - 1));
        } else {
            source.push_str("    return s\n\n");
        }
    }
    source.push_str(&format!("print(f{}(5))\n", count.saturating_sub(1)));
    source
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.bench_function("small_program", |b| {
        b.iter(|| parse_program(black_box(SMALL)).unwrap());
    });
    for count in [10usize, 100] {
        let source = generated_module(count);
        group.bench_with_input(BenchmarkId::new("functions", count), &source, |b, src| {
            b.iter(|| parse_program(black_box(src)).unwrap());
        });
    }
    group.finish();
}

fn bench_static_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("static_analysis");
    for count in [10usize, 100] {
        let program = parse_program(&generated_module(count)).unwrap();
        group.bench_with_input(BenchmarkId::new("functions", count), &program, |b, program| {
            b.iter(|| analyze_program(black_box(program)));
        });
    }
    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");
    let options = ExecutionOptions::default();
    let bindings = InputBindings::new();

    let small = parse_program(SMALL).unwrap();
    group.bench_function("small_program", |b| {
        b.iter(|| execute(black_box(&small), &bindings, &options));
    });

    let loops = parse_program(LOOPS).unwrap();
    group.bench_function("nested_loops_4000_iterations", |b| {
        b.iter(|| execute(black_box(&loops), &bindings, &options));
    });
    group.finish();
}

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation");
    let engine = QuestionEngine::default();
    for strategy in [Strategy::All, Strategy::Diverse, Strategy::Focused] {
        let config = GenerationConfig {
            strategy,
            ..GenerationConfig::default()
        };
        group.bench_with_input(
            BenchmarkId::new("small_program", strategy.as_str()),
            &config,
            |b, config| {
                b.iter(|| engine.generate(black_box(SMALL), None, config));
            },
        );
    }

    let static_only = GenerationConfig {
        enable_dynamic_analysis: false,
        ..GenerationConfig::default()
    };
    let module = generated_module(50);
    group.bench_function("static_only_50_functions", |b| {
        b.iter(|| engine.generate(black_box(&module), None, &static_only));
    });
    group.finish();
}

fn bench_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("guards");
    group.bench_function("clamp_question_limit", |b| {
        b.iter(|| clamp_question_limit(black_box(200)));
    });
    group.bench_function("clamp_stack_depth", |b| {
        b.iter(|| clamp_stack_depth(black_box(5_000)));
    });
    group.bench_function("clamp_timeout_ms", |b| {
        b.iter(|| clamp_timeout_ms(black_box(0)));
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_parse,
    bench_static_analysis,
    bench_execution,
    bench_generation,
    bench_guards,
);
criterion_main!(benches);
