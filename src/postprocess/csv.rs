// src/postprocess/csv.rs
// =============================================================================
// Converts harvest output to CSV rows of the form `url,code,,` (CRLF line
// endings), optionally prefixing every code, e.g. with the short URL host.
// =============================================================================

use std::borrow::Cow;
use std::io::{BufRead, Write};

use anyhow::{bail, Result};

use super::lines;

// Quotes a field when it contains a comma, a quote or a CRLF
fn escape(field: &str) -> Cow<'_, str> {
    if field.contains(',') || field.contains('"') || field.contains("\r\n") {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Writes one CSV row per record. Returns the number of rows.
pub fn to_csv<R: BufRead, W: Write>(input: R, mut output: W, prefix: &str) -> Result<usize> {
    let mut rows = 0;

    for line in lines(input) {
        let (number, line) = line?;
        if line.is_empty() {
            continue;
        }
        let Some((code, url)) = line.split_once('|') else {
            bail!("Line {}: expected 'code|url', got {:?}", number, line);
        };
        let code = format!("{}{}", prefix, code);
        write!(output, "{},{},,\r\n", escape(url), escape(&code))?;
        rows += 1;
    }

    output.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str, prefix: &str) -> String {
        let mut output = Vec::new();
        to_csv(input.as_bytes(), &mut output, prefix).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_plain_rows() {
        assert_eq!(run("a|http://one/\n\nb|http://two/\n", ""), "http://one/,a,,\r\nhttp://two/,b,,\r\n");
    }

    #[test]
    fn test_quoting() {
        assert_eq!(
            run("a|http://x/?q=1,2\nb|http://x/\"q\"\n", ""),
            "\"http://x/?q=1,2\",a,,\r\n\"http://x/\"\"q\"\"\",b,,\r\n"
        );
    }

    #[test]
    fn test_prefix() {
        assert_eq!(run("a|http://one/\n", "http://is.gd/"), "http://one/,http://is.gd/a,,\r\n");
    }
}
