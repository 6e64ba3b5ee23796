//! Element-type probe for a quantized convolution followed by an explicit cast.
//!
//! The probe reports the type the graph declares for its final tensor. Because that
//! tensor is the result of an explicit cast, the declared type cannot reveal an
//! implicit promotion the engine performs inside the convolution itself. When the
//! engine compiles the graph, the executable's own output type is compared against
//! the declared one and any disagreement is logged.

use std::fmt;

use anyhow::{Context, Result};
use convprobe_core::{
    Backend, CompilationDescriptor, ConvolutionConfig, Executable, Feed, Graph, NumericKind,
    Shape,
};
use tracing::{debug, warn};

pub const PROBE_INPUT_SHAPE: [usize; 4] = [1, 32, 64, 64];
pub const PROBE_WEIGHT_SHAPE: [usize; 4] = [32, 32, 3, 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Float16,
    Float32,
    Int32,
    Int8,
    Unknown(u32),
}

impl Classification {
    pub fn of(kind: NumericKind) -> Self {
        match kind {
            NumericKind::Float16 => Classification::Float16,
            NumericKind::Float32 => Classification::Float32,
            NumericKind::Int32 => Classification::Int32,
            NumericKind::Int8 => Classification::Int8,
            NumericKind::Unknown => Classification::Unknown(kind.raw_value()),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Float16 => {
                f.write_str("Result is Float16 (Correct for Mixed Precision Quantization)")
            }
            Classification::Float32 => {
                f.write_str("Result is Float32 (Correct for Mixed Precision Quantization)")
            }
            Classification::Int32 => {
                f.write_str("Result is Int32 (Correct for Integer Quantization)")
            }
            Classification::Int8 => f.write_str(
                "Result is Int8 (Potentially wrapping/overflowing - check if this is desired)",
            ),
            Classification::Unknown(raw) => write!(f, "Result is Unknown: {raw}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeProbeReport {
    pub input_kind: NumericKind,
    pub output_kind: NumericKind,
    /// Output type of the compiled executable, when a device was available to compile on.
    pub compiled_output_kind: Option<NumericKind>,
    pub classification: Classification,
}

impl fmt::Display for TypeProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Input DataType: {}", self.input_kind.raw_value())?;
        writeln!(f, "Output DataType: {}", self.output_kind.raw_value())?;
        write!(f, "{}", self.classification)
    }
}

/// Builds int8 conv -> float16 cast, compiles it and classifies the final tensor type.
pub fn run_type_probe<B: Backend>(backend: &B) -> Result<TypeProbeReport> {
    let kind = NumericKind::Int8;
    let weight_shape = Shape::from(PROBE_WEIGHT_SHAPE);
    let weight_len = weight_shape
        .byte_len(kind)
        .context("probe weights have no element width")?;

    let mut graph = Graph::new();
    let input = graph.declare_input("in", PROBE_INPUT_SHAPE, kind)?;
    let weights = graph.declare_constant(weight_len, weight_shape, kind)?;
    let conv = graph.convolve2d(&input, &weights, ConvolutionConfig::default())?;
    let output = graph.cast(&conv, NumericKind::Float16)?;

    let compiled_output_kind = match backend.system_default_device() {
        Some(device) => {
            let executable = backend
                .compile(
                    &graph,
                    &[Feed::declared(&input)],
                    std::slice::from_ref(&output),
                    &device.compile_target(),
                    &CompilationDescriptor::default(),
                )
                .context("compiling type probe graph")?;
            executable.output_types().first().map(|t| t.kind)
        }
        None => {
            warn!(
                backend = backend.name(),
                "no default device; reporting declared types only"
            );
            None
        }
    };

    match compiled_output_kind {
        Some(compiled) if compiled != output.kind() => warn!(
            declared = %output.kind(),
            compiled = %compiled,
            "engine output type differs from the declared type"
        ),
        Some(compiled) => debug!(compiled = %compiled, "engine output type matches declaration"),
        None => {}
    }

    Ok(TypeProbeReport {
        input_kind: input.kind(),
        output_kind: output.kind(),
        compiled_output_kind,
        classification: Classification::of(output.kind()),
    })
}
