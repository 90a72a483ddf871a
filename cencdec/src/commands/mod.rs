mod decrypt;
mod keyinfo;
mod pssh;

pub use decrypt::Decrypt;
pub use keyinfo::Keyinfo;
pub use pssh::Pssh;

use anyhow::{Result, bail};
use base64::Engine;
use clap::{ColorChoice, Parser, Subcommand};
use log::LevelFilter;
use std::path::Path;

/// Decrypt protected media samples and inspect their protection metadata.
#[derive(Debug, Clone, Parser)]
#[command(version, author = "clitic <clitic21@gmail.com>", about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// When to output colored text.
    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Increase logging verbosity, can be repeated.
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only print errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl Args {
    pub fn level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }

        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Decrypt(Decrypt),
    Keyinfo(Keyinfo),
    Pssh(Pssh),
}

/// Read binary input given as a file path, `hex:..`, `base64:..` or bare hex.
fn read_blob(input: &str) -> Result<Vec<u8>> {
    if let Some(value) = input.strip_prefix("hex:") {
        return Ok(hex::decode(value.trim())?);
    }

    if let Some(value) = input.strip_prefix("base64:") {
        return Ok(base64::engine::general_purpose::STANDARD.decode(value.trim())?);
    }

    let path = Path::new(input);
    if path.is_file() {
        return Ok(std::fs::read(path)?);
    }

    match hex::decode(input.trim()) {
        Ok(data) => Ok(data),
        Err(_) => bail!("'{}' is neither a file nor hex encoded data.", input),
    }
}
