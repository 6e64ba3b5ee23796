use std::process::ExitCode;

use anyhow::Result;
use convprobe_backend_host::HostBackend;
use convprobe_core::Error;
use convprobe_runtime::{run_benchmark_suite, BenchConfig, MonotonicClock};

fn main() -> Result<ExitCode> {
    convprobe_cli::init_tracing();

    let backend = HostBackend::new();
    let clock = MonotonicClock::new();
    let mut stdout = std::io::stdout().lock();

    match run_benchmark_suite(&backend, &BenchConfig::default(), &clock, &mut stdout) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        // The suite has already printed the fatal message.
        Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::DeviceUnavailable)) => {
            tracing::debug!(error = %err, "no benchmark device");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err),
    }
}
