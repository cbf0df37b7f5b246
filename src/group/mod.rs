//! The collective communication surface the hooks are built on.

mod broadcast;
mod local;

pub use broadcast::broadcast_coalesced;
pub use local::LocalGroup;

use crate::{error::CommErr, future::CommFuture, tensor::Tensor};

/// How the contributions of every participant are combined element-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
}

impl ReduceOp {
    /// Combines two elements.
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Sum => a + b,
            Self::Product => a * b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// A fixed set of workers able to run collectives together.
///
/// Collectives never block the caller: they launch the work and return a
/// `CommFuture` resolved once every participant contributed. An `Err` means the
/// collective couldn't be launched at all, failures after launch are carried by
/// the future.
pub trait ProcessGroup: Send + Sync {
    /// This worker's rank within the group.
    fn rank(&self) -> usize;

    /// The amount of workers in the group.
    fn world_size(&self) -> usize;

    /// Reduces `tensors` across all ranks, every rank receives the combined tensors.
    ///
    /// # Arguments
    /// * `tensors` - This rank's contribution, its layout must match on every rank.
    /// * `op` - How contributions are combined.
    fn allreduce(&self, tensors: Vec<Tensor>, op: ReduceOp) -> Result<CommFuture, CommErr>;

    /// Sends the tensors of `root` to every rank.
    ///
    /// # Arguments
    /// * `tensors` - This rank's buffers, only the root's values are kept.
    /// * `root` - The rank whose tensors are broadcast.
    fn broadcast(&self, tensors: Vec<Tensor>, root: usize) -> Result<CommFuture, CommErr>;
}
