use crate::{DeviceBuffer, Feed, Graph, NumericKind, Result, ShapedType, TensorData, TensorHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    GeneralPurpose,
    Accelerator,
}

/// Identifies the backend an executable is compiled for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileTarget {
    kind: TargetKind,
    name: String,
}

impl CompileTarget {
    pub fn general_purpose(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::GeneralPurpose,
            name: name.into(),
        }
    }

    pub fn accelerator(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Accelerator,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptimizationLevel {
    #[default]
    Level0,
    Level1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompilationDescriptor {
    pub optimization_level: OptimizationLevel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionDescriptor {
    pub wait_until_completed: bool,
}

/// A general-purpose compute device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    name: String,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compile_target(&self) -> CompileTarget {
        CompileTarget::general_purpose(self.name.clone())
    }

    /// Zero-filled buffer of exactly `len` bytes.
    pub fn allocate(&self, len: usize) -> Result<DeviceBuffer> {
        DeviceBuffer::zeroed(len)
    }

    pub fn make_queue(&self) -> ExecutionQueue {
        ExecutionQueue {
            device: self.name.clone(),
            submitted: 0,
            completed: 0,
        }
    }
}

/// Runs submitted to one queue complete in submission order.
#[derive(Debug)]
pub struct ExecutionQueue {
    device: String,
    submitted: u64,
    completed: u64,
}

impl ExecutionQueue {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Records a submission and returns its sequence number.
    pub fn submit(&mut self) -> u64 {
        self.submitted += 1;
        self.submitted
    }

    pub fn complete(&mut self, sequence: u64) {
        debug_assert_eq!(sequence, self.completed + 1, "out-of-order completion");
        self.completed = sequence;
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub supported_kinds: &'static [NumericKind],
}

pub trait Backend {
    type Executable: Executable;

    fn name(&self) -> &'static str;

    /// The system's default general-purpose device, if any.
    fn system_default_device(&self) -> Option<Device>;

    /// Dynamic lookup of a device entry point exported by the engine.
    ///
    /// Absence is routine and reported as `None`, never as an error.
    fn lookup_device_entry(&self, symbol: &str) -> Option<CompileTarget>;

    fn compile(
        &self,
        graph: &Graph,
        feeds: &[Feed],
        targets: &[TensorHandle],
        target: &CompileTarget,
        descriptor: &CompilationDescriptor,
    ) -> Result<Self::Executable>;

    fn capabilities(&self) -> BackendCapabilities;
}

pub trait Executable {
    /// Input contract in feed order.
    fn input_types(&self) -> &[ShapedType];

    /// Output types in target order, as the compiled plan produces them.
    fn output_types(&self) -> &[ShapedType];

    /// Runs once. Inputs must match [`Executable::input_types`].
    fn run(
        &mut self,
        queue: &mut ExecutionQueue,
        inputs: &[TensorData],
        descriptor: &ExecutionDescriptor,
    ) -> Result<Vec<TensorData>>;
}
