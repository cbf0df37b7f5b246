use std::{collections::HashMap, sync::Arc};

use futures::{StreamExt, stream::FuturesUnordered};
use log::{debug, info, warn};

use crate::{
    bucket::GradBucket,
    error::{CommErr, HookErr, Result},
    future::CommFuture,
    group::{ProcessGroup, broadcast_coalesced},
    hook::{AllreduceHook, CommHook},
    tensor::Tensor,
};

/// A bucket whose communication was launched but not yet written back.
struct InFlight {
    expected: usize,
    fut: CommFuture,
}

/// Drives a communication hook for every ready bucket and writes the results back.
///
/// Buckets may resolve in any order, each resolved future is tracked by its bucket index.
pub struct Reducer {
    pg: Arc<dyn ProcessGroup>,
    hook: Box<dyn CommHook>,
    hook_registered: bool,
    launched: bool,
    in_flight: HashMap<usize, InFlight>,
}

impl Reducer {
    /// Creates a new `Reducer` averaging gradients with an `AllreduceHook`.
    ///
    /// # Arguments
    /// * `pg` - The process group of the training run.
    pub fn new(pg: Arc<dyn ProcessGroup>) -> Self {
        let hook = Box::new(AllreduceHook::new(Arc::clone(&pg)));

        Self {
            pg,
            hook,
            hook_registered: false,
            launched: false,
            in_flight: HashMap::new(),
        }
    }

    /// Replaces the default hook.
    ///
    /// # Arguments
    /// * `hook` - The hook to call for every ready bucket from now on.
    ///
    /// # Returns
    /// `HookErr::Registration` if a hook was already registered or a bucket was
    /// already launched.
    pub fn register_comm_hook(&mut self, hook: Box<dyn CommHook>) -> Result<()> {
        if self.hook_registered {
            return Err(HookErr::Registration(
                "a communication hook can only be registered once",
            ));
        }

        if self.launched {
            return Err(HookErr::Registration(
                "communication hooks must be registered before the first bucket is launched",
            ));
        }

        info!(hook = hook.name(); "registered communication hook");
        self.hook = hook;
        self.hook_registered = true;
        Ok(())
    }

    /// The name of the hook in use.
    pub fn hook_name(&self) -> &'static str {
        self.hook.name()
    }

    /// The amount of buckets launched and not yet finalized.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Broadcasts the initial parameters from rank 0, once at training start.
    ///
    /// # Arguments
    /// * `params` - The parameters to overwrite with rank 0's values.
    /// * `buffer_size` - The maximum size in bytes of a coalesced chunk.
    pub fn sync_params(
        &self,
        params: &mut [Tensor],
        buffer_size: usize,
    ) -> std::result::Result<(), CommErr> {
        broadcast_coalesced(self.pg.as_ref(), params, buffer_size)
    }

    /// Launches the communication of a bucket whose gradients are all computed.
    ///
    /// # Arguments
    /// * `index` - The bucket's index, where its results are written back.
    /// * `bucket` - The bucket's gradients.
    ///
    /// # Returns
    /// `HookErr::Start` if the bucket is already in flight or the hook failed to start.
    pub fn mark_bucket_ready(&mut self, index: usize, bucket: GradBucket) -> Result<()> {
        if self.in_flight.contains_key(&index) {
            return Err(HookErr::Start {
                bucket: Some(index),
                reason: "the bucket is already in flight".into(),
            });
        }

        let fut = self.hook.start(&bucket).map_err(|e| e.in_bucket(index))?;
        self.launched = true;

        debug!(bucket = index, tensors = bucket.len(), hook = self.hook.name(); "bucket launched");

        let expected = bucket.len();
        self.in_flight.insert(index, InFlight { expected, fut });
        Ok(())
    }

    /// Waits for every launched bucket and writes its results into `grads`.
    ///
    /// Buckets are extracted as their futures resolve, not in launch order. Nothing is
    /// written until every bucket was extracted and checked against `grads`, so a failure
    /// leaves `grads` untouched. There is no timeout, a future that never resolves
    /// stalls this call.
    ///
    /// # Arguments
    /// * `grads` - The gradient storage, indexed by bucket index.
    ///
    /// # Returns
    /// The first failure: a failed future, a rejected result or a size mismatch
    /// against `grads`.
    pub async fn finalize(&mut self, grads: &mut [Vec<Tensor>]) -> Result<()> {
        let mut pending: FuturesUnordered<_> = self
            .in_flight
            .drain()
            .map(|(index, InFlight { expected, fut })| async move {
                (index, expected, fut.await)
            })
            .collect();

        let mut ready = Vec::with_capacity(pending.len());

        while let Some((index, expected, outcome)) = pending.next().await {
            let value = outcome.inspect_err(|e| {
                warn!(bucket = index; "bucket communication failed: {e}");
            })?;

            let tensors = self
                .hook
                .extract(value, expected)
                .map_err(|e| e.in_bucket(index))?;

            let target = grads.get(index).ok_or(HookErr::UnknownBucket(index))?;
            check_layout(target, &tensors).map_err(|e| e.in_bucket(index))?;

            debug!(bucket = index; "bucket extracted");
            ready.push((index, tensors));
        }

        for (index, tensors) in ready {
            copy_into(&mut grads[index], &tensors);
        }

        Ok(())
    }
}

/// Checks that `tensors` has as many tensors as `target`, each with as many elements.
fn check_layout(target: &[Tensor], tensors: &[Tensor]) -> Result<()> {
    if target.len() != tensors.len() {
        return Err(HookErr::result_shape(target.len(), tensors.len()));
    }

    for (dst, src) in target.iter().zip(tensors) {
        if dst.len() != src.len() {
            return Err(HookErr::result_shape(dst.len(), src.len()));
        }
    }

    Ok(())
}

/// Copies `tensors` element-wise into `target`, tensor by tensor.
fn copy_into(target: &mut [Tensor], tensors: &[Tensor]) {
    for (dst, src) in target.iter_mut().zip(tensors) {
        dst.iter_mut().zip(src.iter()).for_each(|(d, s)| *d = *s);
    }
}
