#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can reach the queue and canvas types
// via `psyche_tonic_core::psyche`
pub use psyche;
