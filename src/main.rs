use clap::Parser;

use erasefe::{cli, logger};

fn main() -> std::process::ExitCode {
    // Session log is truncated per launch; panics are mirrored into it.
    logger::init();

    let args = cli::CliArgs::parse();
    cli::run(args)
}
