use convprobe_core::{Backend, CompileTarget, Device, TargetKind};
use tracing::{debug, warn};

/// Entry point the engine exports when a neural accelerator is present.
pub const ACCELERATOR_ENTRY_POINT: &str = "ANEDevice";

/// Yields the compile target for one kind of backend.
///
/// `None` means the backend is absent on this host; callers skip the work that
/// needed it.
pub trait BackendResolver {
    fn target_kind(&self) -> TargetKind;
    fn resolve(&self) -> Option<CompileTarget>;
}

pub struct GeneralPurposeResolver<'a> {
    device: &'a Device,
}

impl<'a> GeneralPurposeResolver<'a> {
    pub fn new(device: &'a Device) -> Self {
        Self { device }
    }

    pub fn target(&self) -> CompileTarget {
        self.device.compile_target()
    }
}

impl BackendResolver for GeneralPurposeResolver<'_> {
    fn target_kind(&self) -> TargetKind {
        TargetKind::GeneralPurpose
    }

    fn resolve(&self) -> Option<CompileTarget> {
        Some(self.target())
    }
}

/// Probes the engine for its accelerator entry point at runtime.
pub struct AcceleratorResolver<'a, B> {
    backend: &'a B,
}

impl<'a, B: Backend> AcceleratorResolver<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }
}

impl<B: Backend> BackendResolver for AcceleratorResolver<'_, B> {
    fn target_kind(&self) -> TargetKind {
        TargetKind::Accelerator
    }

    fn resolve(&self) -> Option<CompileTarget> {
        let target = self.backend.lookup_device_entry(ACCELERATOR_ENTRY_POINT)?;
        if target.kind() != TargetKind::Accelerator {
            warn!(
                backend = self.backend.name(),
                target_name = target.name(),
                "accelerator entry point returned a general-purpose target; ignoring it"
            );
            return None;
        }
        debug!(backend = self.backend.name(), target_name = target.name(), "accelerator resolved");
        Some(target)
    }
}
