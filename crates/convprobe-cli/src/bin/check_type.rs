use anyhow::Result;
use convprobe_backend_host::HostBackend;
use convprobe_runtime::run_type_probe;

fn main() -> Result<()> {
    convprobe_cli::init_tracing();

    let report = run_type_probe(&HostBackend::new())?;
    println!("{report}");
    Ok(())
}
