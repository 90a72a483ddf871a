mod commands;
mod logger;

use clap::{ColorChoice, Parser};
use colored::Colorize;
use commands::{Args, Commands};
use logger::Logger;
use std::{
    io::{IsTerminal, stderr},
    process,
};

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    colored::control::set_override(match args.color {
        ColorChoice::Always => true,
        ColorChoice::Auto => stderr().is_terminal(),
        ColorChoice::Never => false,
    });
    Logger::init(args.level());

    match args.command {
        Commands::Decrypt(args) => args.execute()?,
        Commands::Keyinfo(args) => args.execute()?,
        Commands::Pssh(args) => args.execute()?,
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}: {}", "error".bold().red(), e);
        process::exit(1);
    }
}
