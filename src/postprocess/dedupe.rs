// src/postprocess/dedupe.rs
// =============================================================================
// Removes duplicate records.
//
// Retries can make the same code show up more than once. Records of one code
// are expected next to each other (sort the file first otherwise). A record
// is dropped when its code and URL were already written; the same code with
// a *different* URL is kept and reported on stderr.
// =============================================================================

use std::io::{BufRead, Write};

use anyhow::{bail, Result};
use tracing::warn;

use super::lines;

/// Copies `input` to `output`, dropping repeated records.
///
/// Returns how many records were dropped.
pub fn dedupe<R: BufRead, W: Write>(input: R, mut output: W) -> Result<usize> {
    let mut previous_code: Option<String> = None;
    let mut previous_urls: Vec<String> = Vec::new();
    let mut dropped = 0;

    for line in lines(input) {
        let (number, line) = line?;
        if line.is_empty() {
            continue;
        }
        let Some((code, url)) = line.split_once('|') else {
            bail!("Line {}: expected 'code|url', got {:?}", number, line);
        };

        if previous_code.as_deref() == Some(code) {
            if previous_urls.iter().any(|seen| seen == url) {
                dropped += 1;
                continue;
            }
            warn!("Duplicate URLs for code {:?}", code);
        } else {
            previous_code = Some(code.to_string());
            previous_urls.clear();
        }
        previous_urls.push(url.to_string());
        writeln!(output, "{}|{}", code, url)?;
    }

    output.flush()?;
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> (String, usize) {
        let mut output = Vec::new();
        let dropped = dedupe(input.as_bytes(), &mut output).unwrap();
        (String::from_utf8(output).unwrap(), dropped)
    }

    #[test]
    fn test_drops_exact_repeats() {
        let (output, dropped) = run("a|http://1/\na|http://1/\nb|http://2/\n\nb|http://2/\n");
        assert_eq!(output, "a|http://1/\nb|http://2/\n");
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_keeps_conflicting_urls() {
        let (output, dropped) = run("a|http://1/\na|http://other/\na|http://1/\n");
        assert_eq!(output, "a|http://1/\na|http://other/\n");
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_only_neighbours_are_compared() {
        let (output, _) = run("a|http://1/\nb|http://2/\na|http://1/\n");
        assert_eq!(output, "a|http://1/\nb|http://2/\na|http://1/\n");
    }

    #[test]
    fn test_malformed_line() {
        assert!(dedupe("nopipe\n".as_bytes(), Vec::new()).is_err());
    }
}
