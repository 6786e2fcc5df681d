use anyhow::Context;
use clap::Parser;
use emberprof::cli::{Cli, Command};
use emberprof::error::exit_code;
use std::process::ExitCode;

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<emberprof::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cli.validate()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .context("Invalid arguments")?;

    match cli.command {
        Some(Command::Top {
            ref file,
            top,
            threshold,
            json,
            ref filter,
        }) => {
            let report_path = match file {
                Some(f) => f.clone(),
                None => emberprof::commands::list::most_recent_report(std::path::Path::new("."))?
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "No reports found. Run 'emberprof list' to see available reports."
                        )
                    })?,
            };
            emberprof::commands::top::run(&report_path, top, threshold, json, filter.as_deref())?;
        }
        Some(Command::List { ref dir }) => {
            emberprof::commands::list::run(dir.as_deref())?;
        }
        Some(Command::Completions { shell }) => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "emberprof", &mut std::io::stdout());
        }
        None => {
            // Recording mode
            emberprof::commands::record::run(&cli)?;
        }
    }

    Ok(())
}
