use std::process::ExitCode;

use clap::Parser;
use keyvault_cli::Cli;

fn main() -> ExitCode {
    color_eyre::install().ok();
    let cli = Cli::parse();
    keyvault_cli::run(cli)
}
