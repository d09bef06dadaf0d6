//! Byte patterns with wildcard positions

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A single position in a [`Pattern`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternByte {
    /// The image byte must equal this value
    Exact(u8),
    /// Any byte matches
    Wildcard,
}

impl PatternByte {
    /// Whether `byte` satisfies this position
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            PatternByte::Exact(b) => b == byte,
            PatternByte::Wildcard => true,
        }
    }
}

impl From<u8> for PatternByte {
    fn from(b: u8) -> Self {
        PatternByte::Exact(b)
    }
}

impl From<Option<u8>> for PatternByte {
    fn from(b: Option<u8>) -> Self {
        b.map_or(PatternByte::Wildcard, PatternByte::Exact)
    }
}

/// An ordered, non-empty sequence of byte matchers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(Vec<PatternByte>);

impl Pattern {
    /// Creates a pattern from byte matchers. Fails if `bytes` is empty.
    pub fn new(bytes: Vec<PatternByte>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidPattern("pattern is empty".to_string()));
        }
        Ok(Self(bytes))
    }

    /// Parses IDA-style text such as `"F3 0F 10 05 ?? ?? ?? ?? 0F 28"`.
    ///
    /// `?` and `??` are both accepted as wildcards; tokens are separated by whitespace.
    pub fn from_ida(text: &str) -> Result<Self> {
        let bytes = text
            .split_whitespace()
            .map(|token| match token {
                "?" | "??" => Ok(PatternByte::Wildcard),
                _ => u8::from_str_radix(token, 16)
                    .map(PatternByte::Exact)
                    .map_err(|e| Error::InvalidPattern(format!("token `{token}`: {e}"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(bytes)
    }

    /// Builds a pattern from literal bytes and a same-length mask (`'x'` must match, `'?'` wildcard).
    ///
    /// This is the format used by fixers that patch whole files on disk.
    pub fn from_mask(bytes: &[u8], mask: &str) -> Result<Self> {
        if mask.len() != bytes.len() {
            return Err(Error::InvalidPattern(format!(
                "mask length {} does not match {} literal bytes",
                mask.len(),
                bytes.len()
            )));
        }
        let bytes = bytes
            .iter()
            .zip(mask.chars())
            .map(|(&b, m)| match m {
                'x' | 'X' => Ok(PatternByte::Exact(b)),
                '?' => Ok(PatternByte::Wildcard),
                other => Err(Error::InvalidPattern(format!("unknown mask character `{other}`"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(bytes)
    }

    /// Number of positions in the pattern
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the pattern has no positions. Never true for a constructed pattern.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether at least one position is a literal byte
    pub fn has_literal(&self) -> bool {
        self.0.iter().any(|b| matches!(b, PatternByte::Exact(_)))
    }

    /// The byte matchers
    pub fn bytes(&self) -> &[PatternByte] {
        &self.0
    }

    /// Checks `window` against the pattern, stopping at the first mismatch.
    ///
    /// `window` must be exactly as long as the pattern.
    #[inline]
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.0.len()
            && self
                .0
                .iter()
                .zip(window)
                .all(|(pattern, &byte)| pattern.matches(byte))
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_ida(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match b {
                PatternByte::Exact(b) => write!(f, "{b:02X}")?,
                PatternByte::Wildcard => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ida() {
        let pattern = Pattern::from_ida("F3 0F 10 ?? ? 05").unwrap();
        assert_eq!(
            pattern.bytes(),
            [
                PatternByte::Exact(0xF3),
                PatternByte::Exact(0x0F),
                PatternByte::Exact(0x10),
                PatternByte::Wildcard,
                PatternByte::Wildcard,
                PatternByte::Exact(0x05),
            ]
        );
        assert_eq!(pattern.to_string(), "F3 0F 10 ?? ?? 05");
    }

    #[test]
    fn test_from_ida_rejects_garbage() {
        assert!(matches!(
            Pattern::from_ida("F3 GG"),
            Err(Error::InvalidPattern(_))
        ));
        assert!(matches!(Pattern::from_ida("   "), Err(Error::InvalidPattern(_))));
    }

    #[test]
    fn test_from_mask() {
        let pattern = Pattern::from_mask(b"\x8B\x00\x00\x89", "x??x").unwrap();
        assert_eq!(pattern.to_string(), "8B ?? ?? 89");

        // lengths must agree
        assert!(Pattern::from_mask(b"\x8B\x00", "x??").is_err());
        // only x and ? are allowed
        assert!(Pattern::from_mask(b"\x8B\x00", "x.").is_err());
    }

    #[test]
    fn test_matches_window() {
        let pattern: Pattern = "BB ??".parse().unwrap();
        assert!(pattern.matches(&[0xBB, 0x12]));
        assert!(!pattern.matches(&[0xBA, 0x12]));
        // windows of the wrong length never match
        assert!(!pattern.matches(&[0xBB]));
        assert!(pattern.has_literal());
        assert!(!Pattern::from_ida("?? ??").unwrap().has_literal());
    }
}
