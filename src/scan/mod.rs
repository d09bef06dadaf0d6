//! # Scan
//!
//! Signature scanning over module or file images. A scan walks the image once per pattern,
//! comparing each window byte by byte and stopping at the first mismatch.
//!
//! Not finding a pattern is a normal outcome: patterns are build-specific, so every scan
//! reports absence through `None` (or [`Error::PatternNotFound`] from the policy-aware helpers)
//! and never panics.

use std::ops::Deref;

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub mod pattern;

pub use pattern::{Pattern, PatternByte};

/// A contiguous readable byte range with a base address
///
/// Matches are reported as `base() + offset`. For files the base is 0, so matches are file offsets.
pub trait Image {
    /// Address of the first byte
    fn base(&self) -> usize;
    /// The image contents
    fn bytes(&self) -> &[u8];

    /// Size of the image in bytes
    fn size(&self) -> usize {
        self.bytes().len()
    }

    /// Whether `[address, address + len)` lies entirely inside the image
    fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base()
            && address
                .checked_add(len)
                .map_or(false, |end| end <= self.base() + self.size())
    }
}

impl Image for [u8] {
    fn base(&self) -> usize {
        0
    }

    fn bytes(&self) -> &[u8] {
        self
    }
}

impl Image for Vec<u8> {
    fn base(&self) -> usize {
        0
    }

    fn bytes(&self) -> &[u8] {
        self
    }
}

/// Returns the address of the lowest match of `pattern` in `image`
pub fn scan<I: Image + ?Sized>(image: &I, pattern: &Pattern) -> Option<usize> {
    scan_iter(image, pattern).next()
}

/// Iterates over every match of `pattern` in ascending address order
pub fn scan_iter<'a, I: Image + ?Sized>(
    image: &'a I,
    pattern: &'a Pattern,
) -> impl Iterator<Item = usize> + 'a {
    let base = image.base();
    image
        .bytes()
        .windows(pattern.len())
        .enumerate()
        .filter(move |(_, window)| pattern.matches(window))
        .map(move |(offset, _)| base + offset)
}

/// Scans for a literal byte string with an `x`/`?` mask
pub fn scan_masked<I: Image + ?Sized>(image: &I, bytes: &[u8], mask: &str) -> Result<Option<usize>> {
    let pattern = Pattern::from_mask(bytes, mask)?;
    Ok(scan(image, &pattern))
}

/// Scans for several patterns, keeping results in input order
pub fn scan_all<I: Image + ?Sized>(image: &I, patterns: &[Pattern]) -> ScanResults {
    ScanResults(patterns.iter().map(|p| scan(image, p)).collect())
}

/// Requires `pattern` to match exactly once
pub fn scan_unique<I: Image + ?Sized>(image: &I, pattern: &Pattern, name: &str) -> Result<usize> {
    let mut matches = scan_iter(image, pattern);
    let first = matches.next().ok_or_else(|| Error::PatternNotFound {
        name: name.to_string(),
    })?;
    let extra = matches.count();
    if extra > 0 {
        return Err(Error::AmbiguousPattern {
            name: name.to_string(),
            count: extra + 1,
        });
    }
    Ok(first)
}

/// Results of [`scan_all`], one entry per input pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResults(Vec<Option<usize>>);

impl ScanResults {
    /// True iff every pattern was found
    pub fn all_found(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    /// Returns every address if all patterns were found
    pub fn found(&self) -> Option<Vec<usize>> {
        self.0.iter().copied().collect()
    }

    /// Consumes the results
    pub fn into_inner(self) -> Vec<Option<usize>> {
        self.0
    }
}

impl Deref for ScanResults {
    type Target = [Option<usize>];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// How a [`Signature`] treats more than one match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Exactly one match is required
    #[default]
    Unique,
    /// The lowest match wins; further matches are ignored
    First,
}

/// A named pattern plus the displacement from the match to the bytes of interest
#[derive(Debug, Clone)]
pub struct Signature {
    /// Name used in logs and errors
    pub name: String,
    /// Pattern to search for
    pub pattern: Pattern,
    /// Added to the match address
    pub offset: isize,
    /// Treatment of multiple matches
    pub policy: MatchPolicy,
}

impl Signature {
    /// Creates a signature from IDA-style pattern text
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            pattern: Pattern::from_ida(pattern)?,
            offset: 0,
            policy: MatchPolicy::Unique,
        })
    }

    /// Sets the displacement from the match to the patch site
    pub fn offset(mut self, offset: isize) -> Self {
        self.offset = offset;
        self
    }

    /// Accepts the lowest of several matches instead of requiring a unique one
    pub fn first_match(mut self) -> Self {
        self.policy = MatchPolicy::First;
        self
    }

    /// Finds the signature and returns `match + offset`
    pub fn resolve<I: Image + ?Sized>(&self, image: &I) -> Result<usize> {
        let found = match self.policy {
            MatchPolicy::Unique => scan_unique(image, &self.pattern, &self.name),
            MatchPolicy::First => scan(image, &self.pattern).ok_or_else(|| Error::PatternNotFound {
                name: self.name.clone(),
            }),
        };
        match found {
            Ok(address) => {
                let address = address.wrapping_add_signed(self.offset);
                debug!(signature = %self.name, "found at {address:#x}");
                Ok(address)
            }
            Err(e) => {
                warn!(signature = %self.name, "{e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Image with a non-zero base for checking address arithmetic
    struct Based(usize, Vec<u8>);
    impl Image for Based {
        fn base(&self) -> usize {
            self.0
        }
        fn bytes(&self) -> &[u8] {
            &self.1
        }
    }

    #[test]
    fn test_scan_zeros_with_wildcard() {
        let image = [0u8; 10];
        let pattern = Pattern::new(vec![
            PatternByte::Exact(0),
            PatternByte::Wildcard,
            PatternByte::Exact(0),
        ])
        .unwrap();
        assert_eq!(scan(&image[..], &pattern), Some(0));
    }

    #[test]
    fn test_scan_trailing_wildcard() {
        let image = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let pattern = Pattern::from_ida("BB ??").unwrap();
        assert_eq!(scan(&image[..], &pattern), Some(1));
    }

    #[test]
    fn test_scan_returns_lowest_match() {
        let image = vec![0x90, 0x48, 0x8B, 0x05, 0x48, 0x8B, 0x06, 0x48, 0x8B];
        let pattern = Pattern::from_ida("48 8B ??").unwrap();
        assert_eq!(scan(&image, &pattern), Some(1));
        assert_eq!(scan_iter(&image, &pattern).collect::<Vec<_>>(), [1, 4]);
    }

    #[test]
    fn test_scan_not_found_leaves_image_untouched() {
        let image = vec![1u8, 2, 3, 4, 5];
        let before = image.clone();
        let pattern = Pattern::from_ida("03 05").unwrap();
        assert_eq!(scan(&image, &pattern), None);
        assert_eq!(image, before);

        // patterns longer than the image never match
        let pattern = Pattern::from_ida("01 02 03 04 05 06").unwrap();
        assert_eq!(scan(&image, &pattern), None);
    }

    #[test]
    fn test_scan_adds_base() {
        let image = Based(0x1400_0000, vec![0x00, 0xF3, 0x0F, 0x10]);
        let pattern = Pattern::from_ida("F3 0F").unwrap();
        assert_eq!(scan(&image, &pattern), Some(0x1400_0001));
        assert!(image.contains(0x1400_0001, 3));
        assert!(!image.contains(0x1400_0001, 4));
        assert!(!image.contains(0x13FF_FFFF, 1));
    }

    #[test]
    fn test_scan_masked() {
        let image = vec![0x11, 0xC7, 0x05, 0xAA, 0xBB, 0x80, 0x07];
        let found = scan_masked(&image, b"\xC7\x05\x00\x00\x80\x07", "xx??xx").unwrap();
        assert_eq!(found, Some(1));

        let missing = scan_masked(&image, b"\xC7\x06", "xx").unwrap();
        assert_eq!(missing, None);

        assert!(scan_masked(&image, b"\xC7", "xx").is_err());
    }

    #[test]
    fn test_scan_all() {
        let image = vec![0xAA, 0xBB, 0xCC, 0xDD];
        let patterns = [
            Pattern::from_ida("CC DD").unwrap(),
            Pattern::from_ida("AA").unwrap(),
        ];
        let results = scan_all(&image, &patterns);
        assert_eq!(results.len(), 2);
        assert_eq!(&results[..], [Some(2), Some(0)]);
        assert!(results.all_found());
        assert_eq!(results.found(), Some(vec![2, 0]));

        let patterns = [
            Pattern::from_ida("CC DD").unwrap(),
            Pattern::from_ida("EE").unwrap(),
            Pattern::from_ida("?? BB").unwrap(),
        ];
        let results = scan_all(&image, &patterns);
        assert_eq!(results.len(), 3);
        assert_eq!(&results[..], [Some(2), None, Some(0)]);
        assert!(!results.all_found());
        assert_eq!(results.found(), None);
    }

    #[test]
    fn test_scan_unique() {
        let image = vec![0x0F, 0x28, 0x0F, 0x29, 0x0F, 0x28];
        let pattern = Pattern::from_ida("0F 29").unwrap();
        assert_eq!(scan_unique(&image, &pattern, "store").unwrap(), 2);

        let pattern = Pattern::from_ida("0F 28").unwrap();
        match scan_unique(&image, &pattern, "load") {
            Err(Error::AmbiguousPattern { name, count }) => {
                assert_eq!(name, "load");
                assert_eq!(count, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }

        let pattern = Pattern::from_ida("0F 30").unwrap();
        assert!(scan_unique(&image, &pattern, "missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_signature_resolve() {
        let image = Based(0x1000, vec![0x0F, 0x28, 0x0F, 0x29, 0x0F, 0x28, 0x05]);

        let sig = Signature::new("unique", "0F 28 05").unwrap().offset(2);
        assert_eq!(sig.resolve(&image).unwrap(), 0x1006);

        let sig = Signature::new("ambiguous", "0F 28").unwrap();
        assert!(matches!(
            sig.resolve(&image),
            Err(Error::AmbiguousPattern { count: 2, .. })
        ));

        let sig = Signature::new("first", "0F 28").unwrap().first_match().offset(-1);
        assert_eq!(sig.resolve(&image).unwrap(), 0x0FFF);
    }
}
