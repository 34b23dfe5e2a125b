//! Command handlers

pub mod config;
pub mod device;
pub mod event;
pub mod history;
pub mod status;
pub mod token;
pub mod watch;

use std::io::{self, Write};

use anyhow::{bail, Result};

use crate::output::Output;

/// Ask the operator to confirm, unless `yes` was given
///
/// Outside human mode there is nobody to ask, so the command fails and
/// points at `--yes`.
pub fn confirm(output: &Output, question: &str, yes: bool) -> Result<()> {
    if yes {
        return Ok(());
    }
    if !output.should_prompt() {
        bail!("{} Re-run with --yes to confirm.", question);
    }

    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    if is_yes(&input) {
        Ok(())
    } else {
        bail!("Cancelled.")
    }
}

fn is_yes(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
