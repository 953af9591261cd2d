//! Example of using runtrack-core directly from Rust.

use std::thread;
use std::time::Duration;

use runtrack_core::{RunConfig, RunHandle};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    // 1. Open the run; this starts the background writer
    let run = RunHandle::open(RunConfig::new("sine_demo", "./experiments"))?;
    println!("Started run: {}", run.run_name());

    // 2. Hyperparameters
    run.log_params([("language", serde_yaml::Value::from("Rust")), ("threads", 1.into())])?;

    // 3. Metrics; every call returns immediately
    for i in 0..50u64 {
        let x = i as f64 * 0.1;
        run.log_metrics([("sine", x.sin()), ("cosine", x.cos())], Some(i))?;
        if i % 10 == 0 {
            run.info(format!("step {i}"))?;
        }
        thread::sleep(Duration::from_millis(50));
    }

    // 4. Graceful shutdown: drains the queue and finalizes metadata
    run.close()?;
    println!("Run stored in {}", run.run_dir().display());
    Ok(())
}
