//! Memory planning through the public engine API

use llama_graph::backend::stream::StreamConfig;
use llama_graph::plan::PlanOptions;
use llama_graph::{
    AllocStrategy, DType, Engine, EngineConfig, ExecOptions, Graph, HostTensor, Inputs, PlacementPolicy,
};

fn engine(allow_inplace: bool, strategy: AllocStrategy) -> Engine {
    Engine::from_config(&EngineConfig::default()).unwrap().with_plan_options(PlanOptions {
        strategy,
        allow_inplace,
        ..PlanOptions::default()
    })
}

/// x -> f1 -> f2 -> ... -> fn, each intermediate read once
fn chain(engine: &Engine, len: usize, width: usize) -> Graph {
    let mut b = engine.begin_graph();
    let mut t = b.input("x", DType::F32, &[width]).unwrap();
    for i in 0..len {
        t = if i % 2 == 0 { b.silu(t).unwrap() } else { b.scale(t, 0.5).unwrap() };
    }
    b.set_name(t, "y").unwrap();
    b.mark_output(t).unwrap();
    b.build().unwrap()
}

#[test]
fn test_arena_bounded_by_live_set() {
    for strategy in [AllocStrategy::FirstFit, AllocStrategy::BestFit] {
        let engine = engine(false, strategy);
        let report = engine.dry_run(&chain(&engine, 16, 256)).unwrap();
        let cpu = report.backend("cpu").unwrap();

        // 17 tensors of 1 KiB, never more than two alive at once
        assert_eq!(cpu.planned_tensors, 17);
        assert_eq!(cpu.total_planned_bytes, 17 * 1024);
        assert_eq!(cpu.peak_live_bytes, 2 * 1024);
        assert_eq!(cpu.arena_size, cpu.peak_live_bytes);
        assert_eq!(report.inplace_reuses, 0);
    }
}

#[test]
fn test_inplace_reuses_dying_inputs() {
    let engine = engine(true, AllocStrategy::BestFit);
    let report = engine.dry_run(&chain(&engine, 16, 256)).unwrap();
    let cpu = report.backend("cpu").unwrap();
    // The input must survive the first op; every later op overwrites its input
    assert_eq!(report.inplace_reuses, 15);
    assert_eq!(cpu.arena_size, 2 * 1024);
}

#[test]
fn test_fan_out_keeps_shared_input_alive() {
    let engine = engine(false, AllocStrategy::BestFit);
    let mut b = engine.begin_graph();
    let x = b.input("x", DType::F32, &[64]).unwrap();
    let a = b.relu(x).unwrap();
    let c = b.silu(x).unwrap();
    let d = b.gelu(x).unwrap();
    let ac = b.add(a, c).unwrap();
    let y = b.add(ac, d).unwrap();
    b.set_name(y, "y").unwrap();
    b.mark_output(y).unwrap();
    let graph = b.build().unwrap();

    let report = engine.dry_run(&graph).unwrap();
    let cpu = report.backend("cpu").unwrap();
    // x, a, c and d are all alive when `d` is produced
    assert_eq!(cpu.peak_live_bytes, 4 * 256);
    assert!(cpu.arena_size >= cpu.peak_live_bytes);
    assert!(cpu.arena_size < cpu.total_planned_bytes);

    let mut plan = engine.finalize(&graph).unwrap();
    let x: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 8.0).collect();
    let out = plan
        .execute(
            &Inputs::new().with("x", HostTensor::from_f32(&x, vec![64]).unwrap()),
            &ExecOptions::default(),
        )
        .unwrap();
    let y = out.get("y").unwrap().to_f32_vec().unwrap();
    for (v, x) in y.iter().zip(&x) {
        let silu = x / (1.0 + (-x).exp());
        let gelu = 0.5 * x * (1.0 + (0.797_884_6 * (x + 0.044_715 * x * x * x)).tanh());
        let expected = x.max(0.0) + silu + gelu;
        assert!((v - expected).abs() < 1e-3, "{} vs {}", v, expected);
    }
}

#[test]
fn test_each_backend_gets_its_own_arena() {
    let config = EngineConfig::default().with_stream(StreamConfig::named("accel"));
    let engine = Engine::from_config(&config)
        .unwrap()
        .with_policy(PlacementPolicy::new().rule("y", "accel"))
        .with_plan_options(PlanOptions {
            allow_inplace: false,
            ..PlanOptions::default()
        });
    let report = engine.dry_run(&chain(&engine, 4, 64)).unwrap();

    assert_eq!(report.transfers, 1);
    assert_eq!(report.splits, 2);
    let cpu = report.backend("cpu").unwrap();
    let accel = report.backend("accel").unwrap();
    assert!(cpu.arena_size > 0);
    // The transferred tensor and the output, rounded to the stream alignment
    assert_eq!(accel.planned_tensors, 2);
    assert_eq!(accel.arena_size, 512);
}
