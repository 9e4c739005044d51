use clap::Parser;
use std::process::ExitCode;
use tether::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    tether::cli::run(Cli::parse()).await
}
