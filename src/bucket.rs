use crate::{
    error::{HookErr, Result},
    tensor::Tensor,
};

/// The gradient tensors of one synchronization unit, handed to a communication hook.
///
/// The order of the tensors is the order the dispatcher writes them back in.
#[derive(Debug, Clone)]
pub struct GradBucket {
    tensors: Vec<Tensor>,
}

impl GradBucket {
    /// Creates a new `GradBucket`.
    ///
    /// # Arguments
    /// * `tensors` - The bucket's gradients, one entry per replica or grouped region.
    ///
    /// # Returns
    /// A new `GradBucket` or `HookErr::Start` if `tensors` is empty.
    pub fn new(tensors: Vec<Tensor>) -> Result<Self> {
        if tensors.is_empty() {
            return Err(HookErr::start("a bucket must hold at least one tensor"));
        }

        Ok(Self { tensors })
    }

    /// Returns the bucket's tensors.
    ///
    /// The returned tensors share storage with the bucket.
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// The amount of tensors in this bucket.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Always `false`, a bucket can't be empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// The total amount of elements across all tensors.
    pub fn numel(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn empty_buckets_are_rejected() {
        let err = GradBucket::new(Vec::new()).unwrap_err();
        assert!(matches!(err, HookErr::Start { .. }));
    }

    #[test]
    fn tensors_keep_construction_order() {
        let ts: Vec<_> = (0..5).map(|i| tensor::full(&[i + 1], i as f32)).collect();
        let bucket = GradBucket::new(ts.clone()).unwrap();

        assert_eq!(bucket.tensors(), ts.as_slice());
        assert_eq!(bucket.len(), 5);
        assert_eq!(bucket.numel(), 15);
    }
}
