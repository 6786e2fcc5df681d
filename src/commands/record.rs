use crate::cli::Cli;
use crate::engine::Profiler;
use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Records one profiling session in the foreground until Ctrl-C or the
/// configured session bounds end it.
pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.profiler_config();
    let profiler = Profiler::builder(config, &cli.output_dir)
        .preamble_paths(cli.capture.clone())
        .build();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;

    profiler.start()?;
    eprintln!("Recording (Ctrl-C to stop)...");

    while running.load(Ordering::SeqCst) {
        let Some(status) = profiler.status() else {
            // The worker auto-stopped at a session bound and already
            // wrote the report.
            eprintln!("\nSession reached its configured bound.");
            profiler.shutdown();
            return Ok(());
        };
        eprint!(
            "\rSnapshots: {} | Elapsed: {:?}",
            status.snapshot_count,
            Duration::from_secs(status.elapsed.as_secs())
        );
        std::thread::sleep(Duration::from_millis(250));
    }

    match profiler.stop()? {
        Some(path) => eprintln!("\nRecording complete: {}", path.display()),
        None => eprintln!("\nRecording already finalized."),
    }
    profiler.shutdown();
    Ok(())
}
