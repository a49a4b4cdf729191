mod cli;
mod config;
mod control;
mod runtime;
mod telemetry;
#[cfg(test)]
mod testing;

use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    cli::handle(cli::Cli::parse())
}
