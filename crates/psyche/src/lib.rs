#![doc = include_str!("../README.md")]

mod broadcast;
mod error;
mod frame;
mod generator;
mod job;
mod queue;
mod registry;
mod status;
mod worker;

pub use crate::broadcast::*;
pub use crate::error::*;
pub use crate::frame::*;
pub use crate::generator::*;
pub use crate::job::*;
pub use crate::queue::*;
pub use crate::registry::*;
pub use crate::status::*;
pub use crate::worker::*;
