//! `/proc/self/maps` lookups for Unix targets

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One line of a maps file
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Address range
    pub range: Range<usize>,
    /// `r` permission bit
    pub readable: bool,
    /// Backing file, if any
    pub path: Option<PathBuf>,
}

/// Parses a maps file, skipping lines it does not understand
pub fn parse(text: &str) -> Vec<Mapping> {
    text.lines().filter_map(parse_line).collect()
}

/// Parses `start-end perms offset dev inode [path]`
fn parse_line(line: &str) -> Option<Mapping> {
    let mut fields = line.splitn(6, ' ');
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    // offset, dev, inode
    fields.nth(2)?;
    let path = fields
        .next()
        .map(str::trim)
        .filter(|path| path.starts_with('/'))
        .map(PathBuf::from);

    Some(Mapping {
        range: usize::from_str_radix(start, 16).ok()?..usize::from_str_radix(end, 16).ok()?,
        readable: perms.starts_with('r'),
        path,
    })
}

/// Mappings of the current process
pub fn current() -> Result<Vec<Mapping>> {
    Ok(parse(&fs::read_to_string("/proc/self/maps")?))
}

/// Whether `path` names the module `name`, either by file name or in full
pub fn is_module(path: &Path, name: &str) -> bool {
    path.file_name().map_or(false, |file| file == name) || path == Path::new(name)
}

/// Readable span of the module `name`: from its lowest mapping for as long as the following
/// mappings are readable and back onto each other
pub fn module_span(mappings: &[Mapping], name: &str) -> Option<(PathBuf, Range<usize>)> {
    let first = mappings
        .iter()
        .position(|mapping| mapping.path.as_deref().map_or(false, |path| is_module(path, name)))?;
    let path = mappings[first].path.clone()?;
    if !mappings[first].readable {
        return None;
    }

    let mut span = mappings[first].range.clone();
    for mapping in &mappings[first + 1..] {
        if mapping.range.start != span.end || !mapping.readable {
            break;
        }
        span.end = mapping.range.end;
    }
    Some((path, span))
}

/// File backing the mapping that contains `address`
pub fn path_of(mappings: &[Mapping], address: usize) -> Option<PathBuf> {
    mappings
        .iter()
        .find(|mapping| mapping.range.contains(&address))
        .and_then(|mapping| mapping.path.clone())
}
