mod cli;
mod config;
mod telemetry;

use clap::Parser;

use crate::config::{AppConfig, Cli};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::try_from(cli.global)?;
    let _telemetry = telemetry::enter_runtime(config.chrome_trace_path.as_deref());
    if config.print_metrics {
        telemetry::init_metrics_recorder()?;
    }

    let outcome = cli::run(cli.command, &config);

    if config.print_metrics {
        if let Some(handle) = telemetry::prometheus_handle() {
            print!("{}", handle.render());
        }
    }
    outcome
}
