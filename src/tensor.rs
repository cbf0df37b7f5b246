//! The tensor representation shared by buckets, collectives and hooks.

use ndarray::{ArcArray, IxDyn, ShapeError};

/// A reference counted, copy-on-write n-dimensional `f32` array.
///
/// Cloning a `Tensor` shares its storage, a write through any clone detaches it.
pub type Tensor = ArcArray<f32, IxDyn>;

/// Creates a tensor of the given shape from its row-major elements.
///
/// # Arguments
/// * `shape` - The tensor dimensions.
/// * `data` - The elements, its length must be the product of `shape`.
///
/// # Returns
/// The new tensor or a `ShapeError` if the lengths don't agree.
pub fn from_shape_vec(shape: &[usize], data: Vec<f32>) -> Result<Tensor, ShapeError> {
    ArcArray::from_shape_vec(IxDyn(shape), data)
}

/// Creates a one dimensional tensor.
pub fn from_vec(data: Vec<f32>) -> Tensor {
    ArcArray::from_vec(data).into_dyn()
}

/// Creates a tensor of the given shape with every element set to `value`.
pub fn full(shape: &[usize], value: f32) -> Tensor {
    ArcArray::from_elem(IxDyn(shape), value)
}

/// The size in bytes of the elements of `tensor`.
pub fn nbytes(tensor: &Tensor) -> usize {
    tensor.len() * size_of::<f32>()
}

/// Checks that both tensor sequences have the same amount of tensors with the same shapes.
pub(crate) fn same_layout(a: &[Tensor], b: &[Tensor]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.shape() == y.shape())
}
