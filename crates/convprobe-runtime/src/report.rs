use std::fmt;

/// Printed when no general-purpose device can be acquired.
pub const DEVICE_UNAVAILABLE_MESSAGE: &str = "Error: Metal not supported";

#[derive(Clone, Debug, PartialEq)]
pub struct BenchmarkResult {
    pub label: String,
    pub average_latency_seconds: f64,
    /// Derived throughput in tera-operations per second.
    pub derived_ops_per_second: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CaseOutcome {
    Completed(BenchmarkResult),
    Skipped { label: String },
}

impl CaseOutcome {
    pub fn label(&self) -> &str {
        match self {
            CaseOutcome::Completed(result) => &result.label,
            CaseOutcome::Skipped { label } => label,
        }
    }

    pub fn result(&self) -> Option<&BenchmarkResult> {
        match self {
            CaseOutcome::Completed(result) => Some(result),
            CaseOutcome::Skipped { .. } => None,
        }
    }
}

impl fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Avg: {:.2} ms, Speed: {:.4} TOPS",
            self.label,
            self.average_latency_seconds * 1000.0,
            self.derived_ops_per_second
        )
    }
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseOutcome::Completed(result) => result.fmt(f),
            CaseOutcome::Skipped { label } => write!(f, "[{label}] Skipped: ANE not supported."),
        }
    }
}
