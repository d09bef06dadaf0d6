#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
//! Building blocks for game fixers: programs and injected libraries that correct the field of
//! view, aspect ratio and resolution of games that hard-code them.
//!
//! - [`scan`] finds code by byte signature, with wildcards
//! - [`patcher`] overwrites bytes in memory (with guards that restore them) or in files on disk
//! - [`hook`] diverts a single instruction into a callback that can rewrite registers
//! - [`module`] locates the game's modules and follows them across reloads
//! - [`fixer`], [`config`], [`fov`] and [`logging`] tie those together for a fixer DLL
//!
//! Code generation targets x86-64 only.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("libfix only supports x86_64");

pub mod alloc;
pub mod code;
pub mod config;
pub mod error;
pub mod fixer;
pub mod fov;
pub mod hook;
pub mod logging;
pub mod module;
pub mod patcher;
pub mod scan;

pub use error::{Error, Result};
