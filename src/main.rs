use std::fs::File;
use std::sync::Mutex;

use clap::Parser;
use snafu::prelude::*;
use snafu::{Report, Whatever};
use tracing::error;

use mammo_prep::app::App;
use mammo_prep::config::{Cli, Config};
use mammo_prep::pipeline::StageRegistry;

fn init_logging(verbose: bool, log_file: Option<File>) -> Result<(), Whatever> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // RUST_LOG wins over the verbose flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .whatever_context("Could not set up global logging subscriber")
}

fn main() {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config).unwrap_or_else(|e| {
        eprintln!("[ERROR] {}", Report::from_error(e));
        std::process::exit(-1);
    });

    // nothing on disk changes until the setup is known to be valid
    let app = App::new(cli, config, &StageRegistry::with_builtins()).unwrap_or_else(|e| {
        eprintln!("[ERROR] {}", Report::from_error(e));
        std::process::exit(-1);
    });

    let log_file = app.open_log_file().unwrap_or_else(|e| {
        eprintln!("[ERROR] {}", Report::from_error(e));
        None
    });
    init_logging(app.verbose(), log_file).unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    app.display_setups();

    app.run().unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-1);
    });
}
