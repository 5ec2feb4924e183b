mod convert;
mod error;

pub use error::{Error, Result};

/// Generated protobuf messages and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("psyche");

    /// Encoded descriptor set for gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("psyche_descriptor");
}
