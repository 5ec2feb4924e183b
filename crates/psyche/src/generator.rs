use crate::{error::GenerationError, job::Job};
use bytes::Bytes;

/// The image generator driven by the worker.
///
/// Implementations wrap the single accelerator-bound model instance. The
/// worker owns its generator and calls it through `&mut self`, so at most one
/// generation is in flight at any time without any lock around the call.
///
/// A [`JobKind::Single`](crate::JobKind::Single) job must yield exactly one
/// image and a batch exactly `num_images`; the worker turns any other count
/// into [`GenerationError::ImageCount`].
pub trait Generator: Send + 'static {
    /// Runs img2img for `job` to completion.
    ///
    /// # Errors
    ///
    /// Any failure is reported to the submitter of `job` only.
    fn generate(
        &mut self,
        job: &Job,
    ) -> impl Future<Output = Result<Vec<Bytes>, GenerationError>> + Send;
}
