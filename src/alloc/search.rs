//! Walks the address space outwards from an origin looking for unmapped pages
//!
//! Taken from detour-rs with slight modifications: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;

/// Returns an iterator over free pages after the specified address.
pub fn after(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::After)
}

/// Returns an iterator over free pages before the specified address.
pub fn before(
    origin: usize,
    range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const (), region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::Before)
}

/// Direction for the region search.
#[derive(Clone, Copy)]
enum SearchDirection {
    /// Towards lower addresses
    Before,
    /// Towards higher addresses
    After,
}

/// An iterator searching for free regions.
struct FreeRegionIter {
    /// Range we're iterating over
    range: Range<usize>,
    /// Direction we're searching
    search: SearchDirection,
    /// Current page in the search
    current: usize,
}

impl FreeRegionIter {
    /// Creates a new iterator for free regions.
    fn new(origin: usize, range: Option<Range<usize>>, search: SearchDirection) -> Self {
        let page_size = region::page::size();
        FreeRegionIter {
            range: range.unwrap_or(0..usize::MAX),
            current: origin - origin % page_size,
            search,
        }
    }

    /// Moves one page in the search direction
    fn step(&self, from: usize) -> usize {
        let page_size = region::page::size();
        match self.search {
            SearchDirection::Before => from.saturating_sub(page_size),
            SearchDirection::After => from.saturating_add(page_size),
        }
    }
}

impl Iterator for FreeRegionIter {
    type Item = Result<*const (), region::Error>;

    /// Returns the closest free page for the current address.
    fn next(&mut self) -> Option<Self::Item> {
        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const ()) {
                Ok(region) => {
                    // skip the whole mapped region
                    let range = region.as_range();
                    self.current = match self.search {
                        SearchDirection::Before => self.step(range.start),
                        SearchDirection::After => range.end,
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    let free = self.current as *const ();
                    self.current = self.step(self.current);
                    return Some(Ok(free));
                }
                Err(error) => {
                    self.current = self.step(self.current);
                    return Some(Err(error));
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Free pages found around a mapped address are page aligned and ordered
    fn test_free_pages() {
        let page_size = region::page::size();
        let origin = test_free_pages as fn() as usize;

        let pages: Vec<usize> = after(origin, None)
            .take(2)
            .map(|page| page.unwrap() as usize)
            .collect();
        assert_eq!(pages.len(), 2);
        assert!(pages[0] > origin);
        assert!(pages[1] > pages[0]);

        for page in pages {
            assert_eq!(page % page_size, 0);
        }

        if let Some(Ok(page)) = before(origin, None).next() {
            assert!((page as usize) < origin);
            assert_eq!(page as usize % page_size, 0);
        }
    }
}
