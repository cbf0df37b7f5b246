//! The extension point the reducer calls for every ready bucket.

mod allreduce;

pub use allreduce::AllreduceHook;

use std::sync::Arc;

use crate::{
    bucket::GradBucket,
    error::{HookErr, Result},
    future::CommFuture,
    tensor::Tensor,
};

/// Customizes how the gradients of a bucket are synchronized across workers.
///
/// A hook is bound to one reducer for the whole training run and may be called from
/// a background thread. `start` runs once per bucket, `extract` at most once per
/// bucket and only with the value of the future `start` returned for it.
pub trait CommHook: Send + Sync {
    /// Launches the communication of `bucket` without waiting for it.
    ///
    /// # Arguments
    /// * `bucket` - A fully populated bucket.
    ///
    /// # Returns
    /// A future holding the bucket's new tensors, or `HookErr::Start` if nothing
    /// could be launched.
    fn start(&self, bucket: &GradBucket) -> Result<CommFuture>;

    /// Converts the resolved value of a future into the tensors to write back.
    ///
    /// Local and synchronous, it never communicates.
    ///
    /// # Arguments
    /// * `value` - The value the future returned by `start` resolved to.
    /// * `expected` - The amount of tensors of the originating bucket.
    ///
    /// # Returns
    /// The final tensors, or `HookErr::ResultShape` if their amount is not `expected`.
    fn extract(&self, value: Vec<Tensor>, expected: usize) -> Result<Vec<Tensor>>;

    /// A short name used in logs.
    fn name(&self) -> &'static str {
        "custom"
    }
}

impl<H: CommHook + ?Sized> CommHook for Arc<H> {
    fn start(&self, bucket: &GradBucket) -> Result<CommFuture> {
        (**self).start(bucket)
    }

    fn extract(&self, value: Vec<Tensor>, expected: usize) -> Result<Vec<Tensor>> {
        (**self).extract(value, expected)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Checks the amount of tensors a future resolved to.
pub(crate) fn expect_len(value: &[Tensor], expected: usize) -> Result<()> {
    if value.len() != expected {
        return Err(HookErr::result_shape(expected, value.len()));
    }

    Ok(())
}
