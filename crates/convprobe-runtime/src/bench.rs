//! Throughput benchmark for deep single-shape convolution chains.
//!
//! Each case builds its own graph and weights, compiles them for the resolved target,
//! runs one untimed warmup and then a fixed number of blocking runs on one queue.

use std::io::Write;

use anyhow::{bail, Context, Result};
use convprobe_core::{
    Backend, CompilationDescriptor, ConvolutionConfig, Device, Error, ExecutionDescriptor,
    ExecutionQueue, Executable, Feed, Graph, NumericKind, OptimizationLevel, Shape, ShapedType,
    TargetKind, TensorData, TensorHandle,
};
use tracing::{debug, info};

use crate::{
    AcceleratorResolver, BackendResolver, BenchmarkResult, CaseOutcome, Clock,
    GeneralPurposeResolver, DEVICE_UNAVAILABLE_MESSAGE,
};

pub const DEFAULT_ITERATIONS: usize = 20;

/// `layers` stacked same-padded convolutions sharing one weight tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvWorkload {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub layers: usize,
}

impl Default for ConvWorkload {
    fn default() -> Self {
        Self {
            batch: 1,
            height: 256,
            width: 256,
            in_channels: 128,
            out_channels: 128,
            kernel: 3,
            layers: 20,
        }
    }
}

impl ConvWorkload {
    pub fn input_shape(&self) -> Shape {
        Shape::from_slice(&[self.batch, self.in_channels, self.height, self.width])
    }

    pub fn weight_shape(&self) -> Shape {
        Shape::from_slice(&[self.out_channels, self.in_channels, self.kernel, self.kernel])
    }

    /// Operations in one run of the whole chain, counting multiply and add separately.
    pub fn operations(&self) -> f64 {
        let macs = self.batch
            * self.height
            * self.width
            * self.in_channels
            * self.out_channels
            * self.kernel
            * self.kernel
            * self.layers;
        2.0 * macs as f64
    }

    /// Derived tera-operations per second for one run taking `average_latency_seconds`.
    pub fn tops(&self, average_latency_seconds: f64) -> f64 {
        self.operations() / (average_latency_seconds * 1e12)
    }
}

pub fn default_optimization_level(target: TargetKind) -> OptimizationLevel {
    match target {
        TargetKind::Accelerator => OptimizationLevel::Level1,
        TargetKind::GeneralPurpose => OptimizationLevel::Level0,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BenchmarkCase {
    pub label: String,
    pub target: TargetKind,
    pub kind: NumericKind,
    pub optimization_level: OptimizationLevel,
}

impl BenchmarkCase {
    pub fn new(label: impl Into<String>, target: TargetKind, kind: NumericKind) -> Self {
        Self {
            label: label.into(),
            target,
            kind,
            optimization_level: default_optimization_level(target),
        }
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }
}

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub workload: ConvWorkload,
    pub iterations: usize,
    pub cases: Vec<BenchmarkCase>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        // No general-purpose INT8 case: the GPU path has no int8 convolution.
        Self {
            workload: ConvWorkload::default(),
            iterations: DEFAULT_ITERATIONS,
            cases: vec![
                BenchmarkCase::new("GPU FP16", TargetKind::GeneralPurpose, NumericKind::Float16),
                BenchmarkCase::new("ANE FP16", TargetKind::Accelerator, NumericKind::Float16),
                BenchmarkCase::new("ANE INT8", TargetKind::Accelerator, NumericKind::Int8),
            ],
        }
    }
}

pub struct ConvChain {
    pub graph: Graph,
    pub input: TensorHandle,
    pub output: TensorHandle,
}

/// Builds `workload.layers` convolutions of `kind`, all reading the same zeroed weights.
pub fn build_conv_chain(workload: &ConvWorkload, kind: NumericKind) -> Result<ConvChain> {
    let weight_shape = workload.weight_shape();
    let weight_len = weight_shape
        .byte_len(kind)
        .with_context(|| format!("{kind} has no element width"))?;

    let mut graph = Graph::new();
    let input = graph.declare_input("in", workload.input_shape(), kind)?;
    let weights = graph.declare_constant(weight_len, weight_shape, kind)?;

    let mut output = input.clone();
    for _ in 0..workload.layers {
        output = graph.convolve2d(&output, &weights, ConvolutionConfig::default())?;
    }

    Ok(ConvChain {
        graph,
        input,
        output,
    })
}

/// Runs one warmup, then `iterations` blocking runs; returns the mean latency in seconds.
pub fn time_runs<E, C>(
    executable: &mut E,
    queue: &mut ExecutionQueue,
    inputs: &[TensorData],
    iterations: usize,
    clock: &C,
) -> Result<f64>
where
    E: Executable + ?Sized,
    C: Clock + ?Sized,
{
    if iterations == 0 {
        bail!("at least one timed iteration is required");
    }
    let descriptor = ExecutionDescriptor {
        wait_until_completed: true,
    };

    executable
        .run(queue, inputs, &descriptor)
        .context("warmup run failed")?;

    let start = clock.now_nanos();
    for _ in 0..iterations {
        executable.run(queue, inputs, &descriptor)?;
    }
    let end = clock.now_nanos();

    let duration = end.saturating_sub(start) as f64 / 1e9;
    Ok(duration / iterations as f64)
}

/// Runs one case against the target `resolver` yields, skipping it when there is none.
pub fn run_case<B, C>(
    backend: &B,
    device: &Device,
    resolver: &dyn BackendResolver,
    case: &BenchmarkCase,
    workload: &ConvWorkload,
    iterations: usize,
    clock: &C,
) -> Result<CaseOutcome>
where
    B: Backend,
    C: Clock + ?Sized,
{
    let Some(target) = resolver.resolve() else {
        info!(label = %case.label, target_kind = ?resolver.target_kind(), "backend unavailable, skipping case");
        return Ok(CaseOutcome::Skipped {
            label: case.label.clone(),
        });
    };

    let chain = build_conv_chain(workload, case.kind)
        .with_context(|| format!("building graph for {}", case.label))?;
    let descriptor = CompilationDescriptor {
        optimization_level: case.optimization_level,
    };
    let mut executable = backend
        .compile(
            &chain.graph,
            &[Feed::declared(&chain.input)],
            std::slice::from_ref(&chain.output),
            &target,
            &descriptor,
        )
        .with_context(|| format!("compiling {} for `{}`", case.label, target.name()))?;

    let input_type = ShapedType::new(workload.input_shape(), case.kind);
    let input_len = input_type
        .byte_len()
        .with_context(|| format!("{} has no element width", case.kind))?;
    let buffer = device.allocate(input_len)?;
    let input = TensorData::bind(buffer, input_type)?;
    let mut queue = device.make_queue();

    let average = time_runs(
        &mut executable,
        &mut queue,
        std::slice::from_ref(&input),
        iterations,
        clock,
    )
    .with_context(|| format!("running {}", case.label))?;
    debug!(
        label = %case.label,
        runs = queue.completed(),
        avg_ms = average * 1e3,
        "case finished"
    );

    Ok(CaseOutcome::Completed(BenchmarkResult {
        label: case.label.clone(),
        average_latency_seconds: average,
        derived_ops_per_second: workload.tops(average),
    }))
}

/// Runs every configured case in order and writes one line per case to `out`.
///
/// Without a general-purpose device nothing runs: the fatal message is written and
/// [`Error::DeviceUnavailable`] is returned.
pub fn run_benchmark_suite<B, C, W>(
    backend: &B,
    config: &BenchConfig,
    clock: &C,
    out: &mut W,
) -> Result<Vec<CaseOutcome>>
where
    B: Backend,
    C: Clock + ?Sized,
    W: Write + ?Sized,
{
    let Some(device) = backend.system_default_device() else {
        writeln!(out, "{DEVICE_UNAVAILABLE_MESSAGE}")?;
        return Err(Error::DeviceUnavailable.into());
    };
    info!(backend = backend.name(), device = device.name(), "benchmark device acquired");

    let general_purpose = GeneralPurposeResolver::new(&device);
    let accelerator = AcceleratorResolver::new(backend);

    let mut outcomes = Vec::with_capacity(config.cases.len());
    for case in &config.cases {
        let resolver: &dyn BackendResolver = match case.target {
            TargetKind::GeneralPurpose => &general_purpose,
            TargetKind::Accelerator => &accelerator,
        };
        let outcome = run_case(
            backend,
            &device,
            resolver,
            case,
            &config.workload,
            config.iterations,
            clock,
        )?;
        writeln!(out, "{outcome}")?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
