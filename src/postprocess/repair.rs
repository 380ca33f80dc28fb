// src/postprocess/repair.rs
// =============================================================================
// Cleans up old harvest files.
//
// Older harvests zero-padded their codes ("0001a" instead of "1a") and
// recorded a service's error page as if it were a real target. This filter
// fixes the former and drops the latter, along with records that have no
// usable code or URL.
// =============================================================================

use std::io::{BufRead, Write};

use anyhow::Result;

use super::lines;

/// URLs that are really error pages of a shortener.
pub const BAD_URLS: &[&str] = &["http://4url.cc/error.html"];

/// Copies `input` to `output`, fixing or dropping broken records.
///
/// Returns how many records were dropped.
pub fn repair<R: BufRead, W: Write>(input: R, mut output: W) -> Result<usize> {
    let mut dropped = 0;

    for line in lines(input) {
        let (_, line) = line?;
        if line.is_empty() {
            continue;
        }
        let (code, url) = match line.split_once('|') {
            Some((code, url)) => (code, url),
            None => (line.as_str(), ""),
        };

        let code = code.trim_start_matches('0');
        if code.is_empty() || url.is_empty() || BAD_URLS.contains(&url) {
            dropped += 1;
            continue;
        }
        writeln!(output, "{}|{}", code, url)?;
    }

    output.flush()?;
    Ok(dropped)
}
