//! Pools of executable memory placed near a requested origin
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

use std::error::Error;
use std::fmt::Display;
use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use tracing::debug;

use super::search as region_search;

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

#[derive(Debug)]
/// Errors that occur while creating proximity allocations
pub enum ProximityError {
    /// Ran out of memory within an acceptable proximity to the allocation location
    OutOfMemory,
    /// Error while memmapping a region
    MmapError(mmap::MapError),
    /// Error while querying a memory region
    RegionError(region::Error),
}
impl Display for ProximityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory => write!(
                f,
                "no free memory within jump range of the allocation origin"
            ),
            Self::MmapError(e) => write!(f, "{e}"),
            Self::RegionError(e) => write!(f, "{e}"),
        }
    }
}
impl Error for ProximityError {}

/// A mapped pool and the number of live allocations taken from it
struct Pool {
    /// Chunk allocator over the mapping
    slices: SlicePool<u8>,
    /// Allocations not yet released
    live: usize,
}

impl Pool {
    /// Address range covered by the pool
    fn range(&self) -> Range<usize> {
        let lower = self.slices.as_ptr() as usize;
        lower..lower + self.slices.len()
    }
}

/// Shared instance containing all pools
pub struct ProximityAllocator {
    /// Max distance away from the origin that the pool can be
    max_distance: usize,
    /// Memory pools used for allocations
    pools: Vec<Pool>,
}

impl ProximityAllocator {
    /// Creates an allocator with no pools
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Number of mapped pools
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocates a slice in an eligible memory map.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        let memory_range =
            (origin.saturating_sub(self.max_distance))..(origin.saturating_add(self.max_distance));

        // Check if an existing pool can handle the allocation request
        if let Some(allocation) = self.allocate_memory(&memory_range, size) {
            return Ok(allocation);
        }

        // ... otherwise map a new pool within the memory range
        let slices = self.allocate_pool(&memory_range, origin, size)?;
        let allocation = slices.alloc(size).ok_or(ProximityError::OutOfMemory)?;
        debug!(
            "mapped executable pool at {:#x} for origin {origin:#x}",
            slices.as_ptr() as usize
        );
        self.pools.push(Pool { slices, live: 1 });
        Ok(allocation)
    }

    /// Returns an allocation to its pool, unmapping the pool once it is unused.
    pub fn release(&mut self, value: Allocation) {
        let address = value.as_ptr() as usize;
        drop(value);

        let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.range().contains(&address))
        else {
            return;
        };

        let pool = &mut self.pools[index];
        pool.live = pool.live.saturating_sub(1);
        if pool.live == 0 {
            self.pools.remove(index);
        }
    }

    /// Allocates a chunk using any of the existing pools.
    fn allocate_memory(&mut self, range: &Range<usize>, size: usize) -> Option<Allocation> {
        self.pools
            .iter_mut()
            .filter(|pool| {
                let pool_range = pool.range();
                range.contains(&pool_range.start) && range.contains(&(pool_range.end - 1))
            })
            .find_map(|pool| {
                let allocation = pool.slices.alloc(size)?;
                pool.live += 1;
                Some(allocation)
            })
    }

    /// Maps a new pool close to `origin`.
    fn allocate_pool(
        &mut self,
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        let page_size = region::page::size();
        let pool_size = size.max(1).div_ceil(page_size) * page_size;

        let before = region_search::before(origin, Some(range.clone()));
        let after = region_search::after(origin, Some(range.clone()));

        // Prefer addresses after the origin; some systems refuse mappings below the image
        after
            .chain(before)
            .find_map(|result| match result {
                Ok(address) if !is_free(address as usize, pool_size, page_size) => None,
                Ok(address) => Self::allocate_fixed_pool(address, pool_size)
                    .ok()
                    .filter(|pool| {
                        let lower = pool.as_ptr() as usize;
                        range.contains(&lower) && range.contains(&(lower + pool.len() - 1))
                    })
                    .map(Ok),
                Err(error) => Some(Err(ProximityError::RegionError(error))),
            })
            .unwrap_or(Err(ProximityError::OutOfMemory))
    }

    /// Tries to map memory at the specified address.
    fn allocate_fixed_pool(
        address: *const (),
        size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const _),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => ProximityError::OutOfMemory,
            e => ProximityError::MmapError(e),
        })
        .map(SliceableMemoryMap)
        .map(SlicePool::new)
    }
}

/// Whether every page of `[address, address + len)` is unmapped. Fixed mappings replace
/// whatever is already there.
fn is_free(address: usize, len: usize, page_size: usize) -> bool {
    (address..address.saturating_add(len))
        .step_by(page_size)
        .all(|page| matches!(region::query(page as *const ()), Err(region::Error::UnmappedRegion)))
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// The mapping is only reached through the pool, which synchronises access.
unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}
