//! # Alloc
//!
//! Executable memory for trampolines. Chunks are carved out of page-sized pools that lie within
//! `rel32` jump range of the hook site, so the site only needs a 5-byte jump.
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

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;

use self::proximity::{Allocation, ProximityAllocator, ProximityError};

pub mod proximity;
pub mod search;

/// A thread-safe memory pool for allocating chunks close to addresses.
pub struct ThreadAllocator(Arc<Mutex<ProximityAllocator>>);

impl ThreadAllocator {
    /// Creates a new proximity memory allocator.
    pub fn new(max_distance: usize) -> Self {
        ThreadAllocator(Arc::new(Mutex::new(ProximityAllocator::new(max_distance))))
    }

    /// Allocates read-, write- & executable memory close to `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
        let mut allocator = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        allocator
            .allocate(origin, size)
            .map(|data| ExecutableMemory {
                allocator: self.0.clone(),
                data: Some(data),
            })
    }
}

/// A handle for allocated proximity memory.
pub struct ExecutableMemory {
    /// Proximity allocator for the executable code to reside
    allocator: Arc<Mutex<ProximityAllocator>>,
    /// Actual allocation where the executable code resides. Only `None` while dropping.
    data: Option<Allocation>,
}

impl ExecutableMemory {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.as_ptr() as usize
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
            allocator.release(data);
        }
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

/// The furthest distance between a hook site and its trampoline (2 GiB).
pub const DETOUR_RANGE: usize = 0x8000_0000;

lazy_static! {
    static ref POOL: ThreadAllocator = ThreadAllocator::new(DETOUR_RANGE);
}

/// Allocates an executable buffer from the process-wide pool
///
/// Note: When the executable buffer returns, the buffer's data is undefined, but valid u8 values
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
    POOL.allocate(origin, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Allocations land within range of their origin and are executable
    fn test_allocate_near() {
        let origin = test_allocate_near as fn() as usize;
        let mut memory = allocate_executable(origin, 64).unwrap();
        assert_eq!(memory.len(), 64);
        assert!(memory.address().abs_diff(origin) < DETOUR_RANGE);

        // the memory is writable
        memory.fill(0xCC);
        assert!(memory.iter().all(|&b| b == 0xCC));

        let region = region::query(memory.as_ptr()).unwrap();
        assert!(region.protection().contains(region::Protection::EXECUTE));
    }

    #[test]
    /// Small allocations share a pool
    fn test_allocations_share_pool() {
        let allocator = ThreadAllocator::new(DETOUR_RANGE);
        let origin = test_allocations_share_pool as fn() as usize;

        let first = allocator.allocate(origin, 32).unwrap();
        let second = allocator.allocate(origin, 32).unwrap();
        assert_ne!(first.address(), second.address());
        assert_eq!(allocator.0.lock().unwrap().pool_count(), 1);

        drop(first);
        drop(second);
        assert_eq!(allocator.0.lock().unwrap().pool_count(), 0);
    }
}
