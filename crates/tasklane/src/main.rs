mod cli;
mod commands;
mod context;
mod output;

use clap::Parser;
use cli::{Cli, Command};
use libtasklane_core::TasklaneError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run_command(&cli) {
        output::output_error(&cli, &e);
        std::process::exit(1);
    }
}

fn run_command(cli: &Cli) -> Result<(), TasklaneError> {
    match &cli.command {
        Command::Task { cmd } => commands::task::run(cli, cmd.clone()),
        Command::Sync { cmd } => commands::sync::run(cli, cmd.clone()),
    }
}
