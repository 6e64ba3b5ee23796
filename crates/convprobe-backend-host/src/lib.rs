//! Reference engine that compiles convprobe graphs for the host CPU.
//!
//! It exposes one general-purpose device and no accelerator entry points. Every node
//! is evaluated in `f32` and rounded back to its declared element type, so integer and
//! half-precision graphs behave like their low-precision counterparts without
//! dedicated kernels per type.

mod kernels;
mod plan;

use std::sync::Arc;
use std::time::Instant;

use convprobe_core::{
    Backend, BackendCapabilities, CompilationDescriptor, CompileTarget, Device, DeviceBuffer,
    Error, ExecutionDescriptor, ExecutionQueue, Executable, Feed, Graph, Result, ShapedType,
    TargetKind, TensorData, TensorHandle,
};
use tracing::{debug, trace};

use plan::{Plan, Step, SUPPORTED_KINDS};

pub const HOST_DEVICE_NAME: &str = "host-cpu";

pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HostExecutable {
    plan: Plan,
    input_types: Vec<ShapedType>,
    output_types: Vec<ShapedType>,
}

impl Backend for HostBackend {
    type Executable = HostExecutable;

    fn name(&self) -> &'static str {
        "host"
    }

    fn system_default_device(&self) -> Option<Device> {
        Some(Device::new(HOST_DEVICE_NAME))
    }

    fn lookup_device_entry(&self, symbol: &str) -> Option<CompileTarget> {
        debug!(symbol, "host engine exports no device entry points");
        None
    }

    fn compile(
        &self,
        graph: &Graph,
        feeds: &[Feed],
        targets: &[TensorHandle],
        target: &CompileTarget,
        descriptor: &CompilationDescriptor,
    ) -> Result<Self::Executable> {
        if target.kind() != TargetKind::GeneralPurpose {
            return Err(Error::compilation(format!(
                "host engine cannot compile for {:?} target `{}`",
                target.kind(),
                target.name()
            )));
        }

        let t0 = Instant::now();
        let plan = Plan::lower(graph, feeds, targets, descriptor)?;
        debug!(
            target_name = target.name(),
            level = ?descriptor.optimization_level,
            steps = plan.nodes.len(),
            elapsed_ms = t0.elapsed().as_secs_f64() * 1e3,
            "compiled graph"
        );

        let input_types = feeds.iter().map(|f| f.shaped_type.clone()).collect();
        let output_types = plan.output_types();
        Ok(HostExecutable {
            plan,
            input_types,
            output_types,
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supported_kinds: SUPPORTED_KINDS,
        }
    }
}

impl Executable for HostExecutable {
    fn input_types(&self) -> &[ShapedType] {
        &self.input_types
    }

    fn output_types(&self) -> &[ShapedType] {
        &self.output_types
    }

    fn run(
        &mut self,
        queue: &mut ExecutionQueue,
        inputs: &[TensorData],
        descriptor: &ExecutionDescriptor,
    ) -> Result<Vec<TensorData>> {
        if inputs.len() != self.input_types.len() {
            return Err(Error::contract(format!(
                "expected {} inputs, got {}",
                self.input_types.len(),
                inputs.len()
            )));
        }
        for (idx, (input, expected)) in inputs.iter().zip(&self.input_types).enumerate() {
            if &input.desc != expected {
                return Err(Error::contract(format!(
                    "input {idx} is {:?}, executable was compiled for {expected:?}",
                    input.desc
                )));
            }
        }

        let sequence = queue.submit();
        // Host execution is synchronous, so every run has completed on return.
        let outputs = self.execute(inputs)?;
        queue.complete(sequence);
        trace!(
            queue = queue.device(),
            sequence,
            wait = descriptor.wait_until_completed,
            "run completed"
        );
        Ok(outputs)
    }
}

impl HostExecutable {
    fn execute(&self, inputs: &[TensorData]) -> Result<Vec<TensorData>> {
        let nodes = &self.plan.nodes;
        let mut values: Vec<Option<Arc<Vec<f32>>>> = vec![None; nodes.len()];

        for (idx, node) in nodes.iter().enumerate() {
            let value = match &node.step {
                Step::Input { feed } => Arc::new(kernels::decode(inputs[*feed].bytes(), node.kind)?),
                Step::Constant { raw, decoded } => match decoded {
                    Some(cached) => Arc::clone(cached),
                    None => Arc::new(kernels::decode(raw, node.kind)?),
                },
                Step::Conv2d {
                    input,
                    weights,
                    params,
                } => {
                    let mut out =
                        kernels::conv2d_nchw(operand(&values, *input)?, operand(&values, *weights)?, params);
                    kernels::quantize(&mut out, node.kind);
                    Arc::new(out)
                }
                Step::Cast { input } => {
                    let mut out = operand(&values, *input)?.to_vec();
                    kernels::quantize(&mut out, node.kind);
                    Arc::new(out)
                }
            };
            values[idx] = Some(value);

            for used in node.step.operands() {
                if nodes[used].last_use == idx {
                    values[used] = None;
                }
            }
        }

        self.plan
            .outputs
            .iter()
            .zip(&self.output_types)
            .map(|(&idx, desc)| {
                let data = kernels::encode(operand(&values, idx)?, desc.kind)?;
                TensorData::bind(DeviceBuffer::from_bytes(data), desc.clone())
            })
            .collect()
    }
}

fn operand(values: &[Option<Arc<Vec<f32>>>], idx: usize) -> Result<&[f32]> {
    values[idx]
        .as_deref()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::contract(format!("value {idx} was released before use")))
}
