//! Pluggable gradient communication for data parallel training.
//!
//! A `Reducer` hands every ready `GradBucket` to a `CommHook`, which launches
//! whatever asynchronous communication it wants and returns a `CommFuture`. Once the
//! future resolves, the hook's `extract` turns its value into the tensors written
//! back into the gradients.

pub mod bucket;
pub mod config;
pub mod error;
pub mod foreign;
pub mod future;
pub mod group;
pub mod hook;
pub mod reducer;
pub mod tensor;

pub use bucket::GradBucket;
pub use config::DdpConfig;
pub use error::{CommErr, HookErr};
pub use foreign::{ForeignHook, ForeignRuntime};
pub use future::{CommFuture, Completion};
pub use group::{LocalGroup, ProcessGroup, ReduceOp, broadcast_coalesced};
pub use hook::{AllreduceHook, CommHook};
pub use reducer::Reducer;
pub use tensor::Tensor;
