// src/postprocess/mod.rs
// =============================================================================
// Small stdin -> stdout filters for harvest output files.
//
// Submodules:
// - dedupe: drops repeated records of the same code
// - repair: cleans up files from older harvests (zero padding, junk URLs)
// - csv: converts `code|url` lines to CSV
//
// All of them read `code|url` lines split on '\n' only; a '\r' is part of
// the URL as far as these filters are concerned.
// =============================================================================

mod csv;
mod dedupe;
mod repair;

use std::io::BufRead;

use anyhow::{Context, Result};

pub use self::csv::to_csv;
pub use dedupe::dedupe;
pub use repair::repair;

// Iterates over the raw lines of the input, numbered from 1
fn lines<R: BufRead>(input: R) -> impl Iterator<Item = Result<(usize, String)>> {
    input.split(b'\n').enumerate().map(|(index, line)| {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        Ok((index + 1, String::from_utf8_lossy(&line).into_owned()))
    })
}
