//! Error types for the gRPC surface.
//!
//! This module defines the `Error` enum returned by RPC handlers and its
//! mapping onto `tonic::Status`, so that every failure reaches the client
//! with a status code that says whose fault it was.
//!
//! ## Error Cases
//! - `Core`: anything raised by the queue or the generator. Validation
//!   failures map to `INVALID_ARGUMENT`, generation failures to `INTERNAL`.
//!   Shutdown surfaces as `Core(ServiceShutdown)` and maps to `UNAVAILABLE`.
//! - `InvalidRequest`: the wire message could not be turned into a job.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the generation RPCs.
#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// Raised by the queue, the worker or the generator.
    #[error(transparent)]
    Core(#[from] psyche::Error),

    /// The client request was malformed before any validation could run.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(e) => match e {
                psyche::Error::Validation(e) => Status::invalid_argument(e.to_string()),
                psyche::Error::Generation { job_id, source } => {
                    Status::internal(format!("Generation failed for request {job_id}: {source}"))
                }
                psyche::Error::Cancelled(job_id) => {
                    Status::cancelled(format!("Request {job_id} was cancelled"))
                }
                psyche::Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
                e @ (psyche::Error::Registration { .. } | psyche::Error::ChannelError { .. }) => {
                    Status::internal(e.to_string())
                }
            },
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psyche::{GenerationError, JobId, ValidationError};
    use tonic::Code;

    fn code(err: impl Into<Error>) -> Code {
        Status::from(err.into()).code()
    }

    #[test]
    fn client_faults_are_invalid_argument() {
        assert_eq!(
            code(psyche::Error::Validation(ValidationError::Strength(1.5))),
            Code::InvalidArgument
        );
        assert_eq!(
            code(Error::InvalidRequest {
                reason: "num_images".into()
            }),
            Code::InvalidArgument
        );
    }

    #[test]
    fn generator_faults_are_internal() {
        let status = Status::from(Error::from(psyche::Error::Generation {
            job_id: JobId::new(4),
            source: GenerationError::Backend("out of memory".into()),
        }));
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("request 4"));
        assert!(status.message().contains("out of memory"));
    }

    #[test]
    fn shutdown_and_cancellation() {
        assert_eq!(code(psyche::Error::ServiceShutdown), Code::Unavailable);
        assert_eq!(code(psyche::Error::Cancelled(JobId::new(1))), Code::Cancelled);
    }
}
