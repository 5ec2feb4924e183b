//! gRPC entry points.
//!
//! - [`handler`]: the `GenerationService` implementation (`GenerationHandler`).

pub mod handler;
