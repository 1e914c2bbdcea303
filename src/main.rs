mod cli;

use colored::Colorize;
use regimefolio::error::ErrorHelp;
use std::process::ExitCode;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if let Some(hint) = e.help() {
                eprintln!("{} {}", "hint:".yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}
