//! Engine benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llama_graph::backend::stream::StreamConfig;
use llama_graph::tensor::quant::{dequantize_row, quantize_row};
use llama_graph::{Backend, DType, Engine, EngineConfig, ExecOptions, Graph, HostTensor, Inputs, PlacementPolicy};

fn values(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.013).sin()).collect()
}

/// Quantize and dequantize rows of common model widths
fn quantization(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantization");

    for size in [4096usize, 16384] {
        let src = values(size);
        group.throughput(Throughput::Elements(size as u64));

        for dtype in [DType::Q4_0, DType::Q8_0] {
            let mut packed = vec![0u8; dtype.size_for_elements(size)];
            group.bench_with_input(BenchmarkId::new(format!("quantize_{}", dtype), size), &size, |b, _| {
                b.iter(|| quantize_row(dtype, black_box(&src), &mut packed).unwrap());
            });

            let mut out = vec![0.0f32; size];
            group.bench_with_input(BenchmarkId::new(format!("dequantize_{}", dtype), size), &size, |b, _| {
                b.iter(|| dequantize_row(dtype, black_box(&packed), &mut out).unwrap());
            });
        }
    }

    group.finish();
}

/// One feed-forward block: up projection, SiLU gate, down projection
fn ffn_graph(engine: &Engine, dim: usize, hidden: usize, dtype: DType) -> Graph {
    let registry = engine.registry();
    let cpu = registry.backend(registry.default_backend().unwrap()).unwrap();
    let quantized = |rows: usize, cols: usize| {
        HostTensor::from_f32(&values(rows * cols), vec![rows, cols])
            .unwrap()
            .quantize(dtype)
            .unwrap()
    };
    let up = cpu.upload("ffn_up", &quantized(hidden, dim)).unwrap();
    let gate = cpu.upload("ffn_gate", &quantized(hidden, dim)).unwrap();
    let down = cpu.upload("ffn_down", &quantized(dim, hidden)).unwrap();

    let mut b = engine.begin_graph();
    let x = b.input("x", DType::F32, &[dim, 1]).unwrap();
    let up = b.weight("ffn_up", &up).unwrap();
    let gate = b.weight("ffn_gate", &gate).unwrap();
    let down = b.weight("ffn_down", &down).unwrap();
    let u = b.matmul(up, x).unwrap();
    let g = b.matmul(gate, x).unwrap();
    let g = b.silu(g).unwrap();
    b.set_name(g, "gate").unwrap();
    let h = b.mul(g, u).unwrap();
    let y = b.matmul(down, h).unwrap();
    b.set_name(y, "y").unwrap();
    b.mark_output(y).unwrap();
    b.build().unwrap()
}

fn execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute_ffn");
    group.sample_size(20);

    let config = EngineConfig::default().with_stream(StreamConfig::named("accel"));
    for (dim, hidden) in [(256usize, 768usize), (1024, 2816)] {
        for dtype in [DType::Q4_0, DType::Q8_0] {
            let engine = Engine::from_config(&config).unwrap();
            let graph = ffn_graph(&engine, dim, hidden, dtype);
            let inputs = Inputs::new().with("x", HostTensor::from_f32(&values(dim), vec![dim, 1]).unwrap());

            let mut plan = engine.finalize(&graph).unwrap();
            group.bench_function(BenchmarkId::new(format!("cpu_{}", dtype), dim), |b| {
                b.iter(|| black_box(plan.execute(&inputs, &ExecOptions::default()).unwrap()));
            });

            // Gate on the stream backend, forcing two transfers per pass
            let engine = engine.with_policy(PlacementPolicy::new().rule("gate", "accel"));
            let mut split = engine.finalize(&graph).unwrap();
            group.bench_function(BenchmarkId::new(format!("split_{}", dtype), dim), |b| {
                b.iter(|| black_box(split.execute(&inputs, &ExecOptions::default()).unwrap()));
            });
        }
    }

    group.finish();
}

fn planning(c: &mut Criterion) {
    let engine = Engine::from_config(&EngineConfig::default()).unwrap();
    let mut b = engine.begin_graph();
    let mut t = b.input("x", DType::F32, &[512]).unwrap();
    for i in 0..512 {
        t = if i % 3 == 0 { b.silu(t).unwrap() } else { b.scale(t, 0.99).unwrap() };
    }
    b.mark_output(t).unwrap();
    let graph = b.build().unwrap();

    c.bench_function("finalize_512_nodes", |bench| {
        bench.iter(|| black_box(engine.finalize(black_box(&graph)).unwrap()));
    });
}

criterion_group!(benches, quantization, execute, planning);
criterion_main!(benches);
