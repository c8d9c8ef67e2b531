//! Pure functions for the lockstep runtime.
//!
//! Everything here takes values in and returns values out: no syscalls,
//! no locks, no globals.  The effectful shells ([`crate::clock`],
//! [`crate::checkpoint::mappings`]) call into these so that the arithmetic
//! and interval logic can be tested exhaustively without a live process
//! image.

pub mod clock;
pub mod maps;
