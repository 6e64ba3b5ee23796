use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{Context, Result};
use convprobe_backend_host::HostBackend;
use convprobe_core::{
    Backend, BackendCapabilities, CompilationDescriptor, CompileTarget, Device, Error,
    ExecutionDescriptor, ExecutionQueue, Executable, Feed, Graph, NumericKind, OptimizationLevel,
    ShapedType, TargetKind, TensorData, TensorHandle,
};
use convprobe_runtime::{
    run_benchmark_suite, run_case, time_runs, AcceleratorResolver, BackendResolver, BenchConfig,
    BenchmarkCase, CaseOutcome, Clock, ConvWorkload, GeneralPurposeResolver, MonotonicClock,
    DEVICE_UNAVAILABLE_MESSAGE,
};
use proptest::prelude::*;

/// Clock that only moves when a mock run advances it.
#[derive(Default)]
struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    fn advance(&self, nanos: u64) {
        self.now.set(self.now.get() + nanos);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.get()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CompileCall {
    target: CompileTarget,
    level: OptimizationLevel,
    kind: NumericKind,
}

struct MockBackend {
    clock: Rc<ManualClock>,
    warmup_ns: u64,
    run_ns: u64,
    has_device: bool,
    has_accelerator: bool,
    compiles: RefCell<Vec<CompileCall>>,
    runs: Rc<Cell<usize>>,
}

impl MockBackend {
    fn new(clock: Rc<ManualClock>) -> Self {
        Self {
            clock,
            warmup_ns: 1_000_000,
            run_ns: 2_500_000,
            has_device: true,
            has_accelerator: true,
            compiles: RefCell::new(Vec::new()),
            runs: Rc::new(Cell::new(0)),
        }
    }
}

struct MockExecutable {
    clock: Rc<ManualClock>,
    warmup_ns: u64,
    run_ns: u64,
    runs: Rc<Cell<usize>>,
    inputs: Vec<ShapedType>,
    outputs: Vec<ShapedType>,
}

impl Backend for MockBackend {
    type Executable = MockExecutable;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn system_default_device(&self) -> Option<Device> {
        self.has_device.then(|| Device::new("mock-gpu"))
    }

    fn lookup_device_entry(&self, symbol: &str) -> Option<CompileTarget> {
        (self.has_accelerator && symbol == "ANEDevice").then(|| CompileTarget::accelerator("mock-ane"))
    }

    fn compile(
        &self,
        _graph: &Graph,
        feeds: &[Feed],
        targets: &[TensorHandle],
        target: &CompileTarget,
        descriptor: &CompilationDescriptor,
    ) -> convprobe_core::Result<MockExecutable> {
        self.compiles.borrow_mut().push(CompileCall {
            target: target.clone(),
            level: descriptor.optimization_level,
            kind: feeds[0].shaped_type.kind,
        });
        Ok(MockExecutable {
            clock: Rc::clone(&self.clock),
            warmup_ns: self.warmup_ns,
            run_ns: self.run_ns,
            runs: Rc::clone(&self.runs),
            inputs: feeds.iter().map(|f| f.shaped_type.clone()).collect(),
            outputs: targets
                .iter()
                .map(|t| ShapedType::new(t.shape().clone(), t.kind()))
                .collect(),
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supported_kinds: &[NumericKind::Int8, NumericKind::Float16],
        }
    }
}

impl Executable for MockExecutable {
    fn input_types(&self) -> &[ShapedType] {
        &self.inputs
    }

    fn output_types(&self) -> &[ShapedType] {
        &self.outputs
    }

    fn run(
        &mut self,
        queue: &mut ExecutionQueue,
        inputs: &[TensorData],
        descriptor: &ExecutionDescriptor,
    ) -> convprobe_core::Result<Vec<TensorData>> {
        assert!(descriptor.wait_until_completed);
        assert_eq!(inputs.len(), self.inputs.len());
        let sequence = queue.submit();
        let latency = if self.runs.get() == 0 {
            self.warmup_ns
        } else {
            self.run_ns
        };
        self.clock.advance(latency);
        self.runs.set(self.runs.get() + 1);
        queue.complete(sequence);
        Ok(Vec::new())
    }
}

fn tiny_workload() -> ConvWorkload {
    ConvWorkload {
        batch: 1,
        height: 8,
        width: 8,
        in_channels: 4,
        out_channels: 4,
        kernel: 3,
        layers: 2,
    }
}

fn tiny_config() -> BenchConfig {
    BenchConfig {
        workload: tiny_workload(),
        iterations: 5,
        ..BenchConfig::default()
    }
}

#[test]
fn average_latency_equals_per_run_latency() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let backend = MockBackend::new(Rc::clone(&clock));
    let device = backend.system_default_device().context("mock device")?;
    let case = BenchmarkCase::new("GPU FP16", TargetKind::GeneralPurpose, NumericKind::Float16);

    let outcome = run_case(
        &backend,
        &device,
        &GeneralPurposeResolver::new(&device),
        &case,
        &tiny_workload(),
        20,
        &*clock,
    )?;
    let result = outcome.result().context("case should complete")?;
    assert!((result.average_latency_seconds - 0.0025).abs() < 1e-12);
    assert_eq!(backend.runs.get(), 21);
    Ok(())
}

#[test]
fn warmup_latency_does_not_leak_into_the_average() -> Result<()> {
    let mut averages = Vec::new();
    for warmup_ns in [0, 1_000, 5_000_000_000] {
        let clock = Rc::new(ManualClock::default());
        let mut backend = MockBackend::new(Rc::clone(&clock));
        backend.warmup_ns = warmup_ns;
        let device = backend.system_default_device().context("mock device")?;
        let case = BenchmarkCase::new("GPU FP16", TargetKind::GeneralPurpose, NumericKind::Float16);
        let outcome = run_case(
            &backend,
            &device,
            &GeneralPurposeResolver::new(&device),
            &case,
            &tiny_workload(),
            20,
            &*clock,
        )?;
        averages.push(outcome.result().context("completed")?.average_latency_seconds);
    }
    assert!(averages.windows(2).all(|w| w[0] == w[1]), "{averages:?}");
    Ok(())
}

#[test]
fn zero_iterations_are_rejected() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let backend = MockBackend::new(Rc::clone(&clock));
    let device = backend.system_default_device().context("mock device")?;
    let mut graph = Graph::new();
    let input = graph.declare_input("in", [1, 1, 2, 2], NumericKind::Float16)?;
    let mut exe = backend.compile(
        &graph,
        &[Feed::declared(&input)],
        &[input.clone()],
        &device.compile_target(),
        &CompilationDescriptor::default(),
    )?;
    let mut queue = device.make_queue();
    assert!(time_runs(&mut exe, &mut queue, &[], 0, &*clock).is_err());
    assert_eq!(queue.submitted(), 0);
    Ok(())
}

#[test]
fn default_workload_tops_matches_formula() {
    let workload = ConvWorkload::default();
    let t = 0.05;
    let expected = 2.0 * (256.0 * 256.0 * 128.0 * 128.0 * 9.0 * 20.0) / (t * 1e12);
    assert_eq!(workload.tops(t), expected);
}

proptest! {
    #[test]
    fn tops_is_pure_arithmetic_on_injected_latency(
        b in 1usize..4,
        h in 1usize..512,
        w in 1usize..512,
        ci in 1usize..256,
        co in 1usize..256,
        k in 1usize..8,
        l in 1usize..32,
        t in 1e-6f64..10.0,
    ) {
        let workload = ConvWorkload {
            batch: b,
            height: h,
            width: w,
            in_channels: ci,
            out_channels: co,
            kernel: k,
            layers: l,
        };
        let macs = (b * h * w * ci * co * k * k * l) as f64;
        prop_assert_eq!(workload.tops(t), 2.0 * macs / (t * 1e12));
    }
}

#[test]
fn accelerator_cases_use_aggressive_optimization() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let backend = MockBackend::new(Rc::clone(&clock));
    let mut out = Vec::new();

    let outcomes = run_benchmark_suite(&backend, &tiny_config(), &*clock, &mut out)?;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.result().is_some()));

    let calls = backend.compiles.borrow();
    let summary: Vec<_> = calls
        .iter()
        .map(|c| (c.target.kind(), c.level, c.kind))
        .collect();
    assert_eq!(
        summary,
        vec![
            (TargetKind::GeneralPurpose, OptimizationLevel::Level0, NumericKind::Float16),
            (TargetKind::Accelerator, OptimizationLevel::Level1, NumericKind::Float16),
            (TargetKind::Accelerator, OptimizationLevel::Level1, NumericKind::Int8),
        ]
    );
    Ok(())
}

#[test]
fn optimization_level_is_configurable_per_case() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let backend = MockBackend::new(Rc::clone(&clock));
    let config = BenchConfig {
        cases: vec![
            BenchmarkCase::new("GPU FP16 O1", TargetKind::GeneralPurpose, NumericKind::Float16)
                .with_optimization_level(OptimizationLevel::Level1),
        ],
        ..tiny_config()
    };
    run_benchmark_suite(&backend, &config, &*clock, &mut std::io::sink())?;
    assert_eq!(backend.compiles.borrow()[0].level, OptimizationLevel::Level1);
    Ok(())
}

#[test]
fn missing_accelerator_skips_only_accelerator_cases() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let mut backend = MockBackend::new(Rc::clone(&clock));
    backend.has_accelerator = false;
    let mut out = Vec::new();

    let outcomes = run_benchmark_suite(&backend, &tiny_config(), &*clock, &mut out)?;

    // Only the general-purpose case reached the compiler.
    assert_eq!(backend.compiles.borrow().len(), 1);
    assert_eq!(backend.runs.get(), 6);
    assert!(outcomes[0].result().is_some());
    assert_eq!(
        outcomes[1..],
        [
            CaseOutcome::Skipped {
                label: "ANE FP16".into()
            },
            CaseOutcome::Skipped {
                label: "ANE INT8".into()
            },
        ]
    );

    let text = String::from_utf8(out)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("[GPU FP16] Avg: 2.50 ms, Speed: "), "{text}");
    assert_eq!(lines[1], "[ANE FP16] Skipped: ANE not supported.");
    assert_eq!(lines[2], "[ANE INT8] Skipped: ANE not supported.");
    Ok(())
}

#[test]
fn skipped_case_does_not_disturb_later_measurements() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let mut backend = MockBackend::new(Rc::clone(&clock));
    backend.has_accelerator = false;
    let config = BenchConfig {
        cases: vec![
            BenchmarkCase::new("ANE FP16", TargetKind::Accelerator, NumericKind::Float16),
            BenchmarkCase::new("GPU FP16", TargetKind::GeneralPurpose, NumericKind::Float16),
        ],
        ..tiny_config()
    };
    let outcomes = run_benchmark_suite(&backend, &config, &*clock, &mut std::io::sink())?;
    let result = outcomes[1].result().context("gpu case completes")?;
    assert!((result.average_latency_seconds - 0.0025).abs() < 1e-12);
    Ok(())
}

#[test]
fn missing_device_runs_nothing() -> Result<()> {
    let clock = Rc::new(ManualClock::default());
    let mut backend = MockBackend::new(Rc::clone(&clock));
    backend.has_device = false;
    let mut out = Vec::new();

    let err = run_benchmark_suite(&backend, &tiny_config(), &*clock, &mut out)
        .err()
        .context("suite should fail without a device")?;
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::DeviceUnavailable)
    ));
    assert_eq!(String::from_utf8(out)?, format!("{DEVICE_UNAVAILABLE_MESSAGE}\n"));
    assert!(backend.compiles.borrow().is_empty());
    assert_eq!(backend.runs.get(), 0);
    Ok(())
}

#[test]
fn accelerator_resolver_reports_absence_as_none() {
    let clock = Rc::new(ManualClock::default());
    let mut backend = MockBackend::new(clock);
    let resolver = AcceleratorResolver::new(&backend);
    assert_eq!(
        resolver.resolve().map(|t| t.kind()),
        Some(TargetKind::Accelerator)
    );

    backend.has_accelerator = false;
    let resolver = AcceleratorResolver::new(&backend);
    assert!(resolver.resolve().is_none());
}

#[test]
fn host_engine_completes_general_purpose_case_and_skips_accelerator() -> Result<()> {
    let backend = HostBackend::new();
    let clock = MonotonicClock::new();
    let config = BenchConfig {
        iterations: 2,
        ..tiny_config()
    };
    let mut out = Vec::new();
    let outcomes = run_benchmark_suite(&backend, &config, &clock, &mut out)?;

    let result = outcomes[0].result().context("host case completes")?;
    assert!(result.average_latency_seconds >= 0.0);
    assert!(result.derived_ops_per_second.is_finite() || result.average_latency_seconds == 0.0);

    let text = String::from_utf8(out)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("[GPU FP16] Avg: "), "{text}");
    assert!(lines[0].ends_with(" TOPS"), "{text}");
    assert_eq!(
        lines[1..],
        [
            "[ANE FP16] Skipped: ANE not supported.",
            "[ANE INT8] Skipped: ANE not supported."
        ]
    );
    Ok(())
}
