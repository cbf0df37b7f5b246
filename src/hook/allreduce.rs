use std::{fmt, sync::Arc};

use log::debug;

use super::{CommHook, expect_len};
use crate::{
    bucket::GradBucket,
    error::{HookErr, Result},
    future::CommFuture,
    group::{ProcessGroup, ReduceOp},
    tensor::Tensor,
};

/// The default hook, averages every bucket across the process group.
///
/// `start` sums the bucket across all ranks, `extract` divides the sum by the world size.
#[derive(Clone)]
pub struct AllreduceHook {
    pg: Arc<dyn ProcessGroup>,
}

impl AllreduceHook {
    /// Creates a new `AllreduceHook`.
    ///
    /// # Arguments
    /// * `pg` - The process group the buckets are reduced in.
    pub fn new(pg: Arc<dyn ProcessGroup>) -> Self {
        Self { pg }
    }
}

impl CommHook for AllreduceHook {
    fn start(&self, bucket: &GradBucket) -> Result<CommFuture> {
        debug!(rank = self.pg.rank(), tensors = bucket.len(); "launching allreduce");

        self.pg
            .allreduce(bucket.tensors().to_vec(), ReduceOp::Sum)
            .map_err(|e| HookErr::start(e.to_string()))
    }

    fn extract(&self, mut value: Vec<Tensor>, expected: usize) -> Result<Vec<Tensor>> {
        expect_len(&value, expected)?;

        // Divides even for a world of one.
        let world_size = self.pg.world_size() as f32;
        for t in &mut value {
            *t /= world_size;
        }

        Ok(value)
    }

    fn name(&self) -> &'static str {
        "allreduce"
    }
}

impl fmt::Debug for AllreduceHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllreduceHook")
            .field("rank", &self.pg.rank())
            .field("world_size", &self.pg.world_size())
            .finish()
    }
}
