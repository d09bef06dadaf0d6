//! # Code
//!
//! Machine code emitted into patch sites and trampolines

pub mod x64;
