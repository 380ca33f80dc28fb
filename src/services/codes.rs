// src/services/codes.rs
// =============================================================================
// The code space of a shortener.
//
// Every shortener hands out codes built from a fixed, ordered alphabet
// ("0123456789abcdefghijklmnopqrstuvwxyz" for tinyurl, for example).
// We treat a code as a mixed-radix number over that alphabet, so we can:
// - step to the next code (advance)
// - compare two codes (shorter codes come first)
// - check that a start/stop pair actually describes a walkable range
// =============================================================================

use std::cmp::Ordering;

use super::ServiceError;

/// An ordered alphabet defining which codes exist and in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSpace {
    charset: &'static str,
}

impl CodeSpace {
    /// Creates a code space from an ASCII alphabet, lowest symbol first.
    pub const fn new(charset: &'static str) -> Self {
        Self { charset }
    }

    pub fn charset(&self) -> &'static str {
        self.charset
    }

    /// True when every character of `code` is part of the alphabet.
    pub fn contains(&self, code: &str) -> bool {
        !code.is_empty() && code.bytes().all(|b| self.position(b).is_some())
    }

    // Index of a symbol inside the alphabet
    fn position(&self, symbol: u8) -> Option<usize> {
        self.charset.bytes().position(|c| c == symbol)
    }

    /// Returns the code that follows `code`.
    ///
    /// The rightmost character is the least significant one. It is bumped to
    /// its successor; when it was the last symbol it wraps to the first one
    /// and the carry moves one position left. A carry past the leftmost
    /// character grows the code by one symbol.
    ///
    /// Example (tinyurl alphabet): "9" -> "a", "0z" -> "10", "z" -> "00"
    pub fn advance(&self, code: &str) -> Result<String, ServiceError> {
        let symbols = self.charset.as_bytes();
        let (first, last) = match (symbols.first(), symbols.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(ServiceError::InvalidCode(code.to_string())),
        };

        let mut bytes = code.as_bytes().to_vec();
        for i in (0..bytes.len()).rev() {
            if bytes[i] == last {
                // Wraparound - reset and carry into the next position
                bytes[i] = first;
                continue;
            }
            let index = self
                .position(bytes[i])
                .ok_or_else(|| ServiceError::InvalidCode(code.to_string()))?;
            bytes[i] = symbols[index + 1];
            return Ok(into_code(bytes));
        }

        // Every position wrapped around, so the code grows by one symbol
        bytes.insert(0, first);
        Ok(into_code(bytes))
    }

    /// Orders two codes the same way `advance` walks them.
    ///
    /// Returns None if either code contains symbols outside the alphabet.
    pub fn compare(&self, a: &str, b: &str) -> Option<Ordering> {
        if !self.contains(a) || !self.contains(b) {
            return None;
        }
        match a.len().cmp(&b.len()) {
            Ordering::Equal => {}
            other => return Some(other),
        }
        for (x, y) in a.bytes().zip(b.bytes()) {
            let ordering = self.position(x)?.cmp(&self.position(y)?);
            if ordering != Ordering::Equal {
                return Some(ordering);
            }
        }
        Some(Ordering::Equal)
    }

    /// True when repeatedly advancing `start` eventually reaches `stop`.
    pub fn is_walkable(&self, start: &str, stop: &str) -> bool {
        matches!(
            self.compare(start, stop),
            Some(Ordering::Less | Ordering::Equal)
        )
    }
}

// The alphabet is ASCII, so the bytes are always valid UTF-8
fn into_code(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINYURL: CodeSpace = CodeSpace::new("0123456789abcdefghijklmnopqrstuvwxyz");
    const BITLY: CodeSpace =
        CodeSpace::new("0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_");

    #[test]
    fn test_advance_simple() {
        assert_eq!(TINYURL.advance("0").unwrap(), "1");
        assert_eq!(TINYURL.advance("9").unwrap(), "a");
    }

    #[test]
    fn test_advance_carries() {
        assert_eq!(TINYURL.advance("0z").unwrap(), "10");
        assert_eq!(TINYURL.advance("z").unwrap(), "00");
        assert_eq!(TINYURL.advance("zz").unwrap(), "000");
    }

    #[test]
    fn test_advance_bitly_alphabet() {
        assert_eq!(BITLY.advance("z").unwrap(), "A");
        assert_eq!(BITLY.advance("Z").unwrap(), "-");
        assert_eq!(BITLY.advance("-").unwrap(), "_");
        assert_eq!(BITLY.advance("_").unwrap(), "00");
        assert_eq!(BITLY.advance("0_").unwrap(), "10");
    }

    #[test]
    fn test_advance_rejects_foreign_symbols() {
        assert!(TINYURL.advance("A").is_err());
    }

    #[test]
    fn test_length_only_grows_on_full_wraparound() {
        let space = CodeSpace::new("012");
        let mut code = "0".to_string();
        let mut walked = vec![code.clone()];
        for _ in 0..12 {
            let next = space.advance(&code).unwrap();
            if next.len() > code.len() {
                assert!(code.bytes().all(|b| b == b'2'), "grew from {}", code);
            }
            code = next;
            walked.push(code.clone());
        }
        assert_eq!(&walked[..5], &["0", "1", "2", "00", "01"]);
        assert_eq!(walked[12], "000");
    }

    #[test]
    fn test_compare_orders_by_length_then_symbols() {
        assert_eq!(TINYURL.compare("z", "00"), Some(Ordering::Less));
        assert_eq!(TINYURL.compare("a9", "b0"), Some(Ordering::Less));
        assert_eq!(TINYURL.compare("ab", "ab"), Some(Ordering::Equal));
        assert_eq!(TINYURL.compare("A", "b"), None);
    }

    #[test]
    fn test_walkable_range() {
        assert!(TINYURL.is_walkable("0", "z"));
        assert!(TINYURL.is_walkable("5", "5"));
        assert!(!TINYURL.is_walkable("00", "z"));
        assert!(!TINYURL.is_walkable("", "z"));
    }
}
