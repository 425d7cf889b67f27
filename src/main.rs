use std::{
    env,
    io::{self, IsTerminal, Write},
    process::ExitCode,
};

use anyhow::Result;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::devices::Config;

mod cli;
mod devices;
mod interpreter;

fn main() -> ExitCode {
    if !io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<u8> {
    let config = Config::load()?;
    let mut registry = devices::discover(&config)?;

    let args: Vec<String> = env::args().collect();
    let mut stdout = io::stdout().lock();
    let code = interpreter::dispatch(&mut registry, &args, &mut stdout)?;
    stdout.flush()?;

    // Handles must be released before process teardown; dropping them
    // during exit trips a close bug in some libusb builds.
    drop(registry);
    Ok(code)
}
