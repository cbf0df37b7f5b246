//! Hooks whose logic lives in another runtime, reached through opaque handles.

#[cfg(feature = "python")]
pub mod python;

use std::fmt;

use log::{debug, warn};

use crate::{
    bucket::GradBucket,
    error::{CommErr, HookErr, Result},
    future::CommFuture,
    hook::{CommHook, expect_len},
    tensor::Tensor,
};

/// The call boundary into a foreign runtime.
///
/// Foreign objects may only be touched while the runtime's execution lock is held,
/// which `with_lock` proves by handing out a `Token`.
pub trait ForeignRuntime: Send + Sync + 'static {
    /// A reference counted object owned by the foreign runtime.
    type Object: Send + Sync;

    /// Evidence that the execution lock is held.
    type Token<'t>: Copy;

    /// What a foreign call raises.
    type Error: fmt::Display;

    /// Runs `f` while holding the execution lock.
    fn with_lock<T>(&self, f: impl for<'t> FnOnce(Self::Token<'t>) -> T) -> T;

    /// Increments the reference count of `obj`, returning the new owning handle.
    fn retain(&self, token: Self::Token<'_>, obj: &Self::Object) -> Self::Object;

    /// Decrements the reference count of `obj` and gives the handle up.
    fn release(&self, token: Self::Token<'_>, obj: Self::Object);

    /// Calls the foreign hook with its state and a bucket.
    ///
    /// # Returns
    /// The future the foreign hook produced, or what it raised.
    fn invoke(
        &self,
        token: Self::Token<'_>,
        hook: &Self::Object,
        state: &Self::Object,
        bucket: &GradBucket,
    ) -> std::result::Result<CommFuture, Self::Error>;

    /// Converts a resolved value through the foreign side.
    ///
    /// The default keeps the value as is, it already is a tensor sequence.
    fn convert(
        &self,
        _token: Self::Token<'_>,
        _hook: &Self::Object,
        value: Vec<Tensor>,
    ) -> std::result::Result<Vec<Tensor>, Self::Error> {
        Ok(value)
    }
}

/// A communication hook driven by a foreign callback and its persistent state.
///
/// Both handles are retained on registration and released exactly once when the
/// hook is dropped.
pub struct ForeignHook<R: ForeignRuntime> {
    runtime: R,
    state: Option<R::Object>,
    hook: Option<R::Object>,
}

impl<R: ForeignRuntime> ForeignHook<R> {
    /// Registers a foreign hook.
    ///
    /// # Arguments
    /// * `runtime` - The boundary to call the foreign runtime through.
    /// * `state` - Passed to every invocation of `hook`.
    /// * `hook` - The foreign callable.
    ///
    /// # Returns
    /// A new `ForeignHook` holding its own reference to both objects.
    pub fn new(runtime: R, state: &R::Object, hook: &R::Object) -> Self {
        let (state, hook) = runtime.with_lock(|token| {
            (runtime.retain(token, state), runtime.retain(token, hook))
        });

        Self {
            runtime,
            state: Some(state),
            hook: Some(hook),
        }
    }

    fn handles(&self) -> Result<(&R::Object, &R::Object)> {
        match (&self.state, &self.hook) {
            (Some(state), Some(hook)) => Ok((state, hook)),
            _ => Err(HookErr::start("the foreign hook was already released")),
        }
    }
}

impl<R: ForeignRuntime> CommHook for ForeignHook<R> {
    fn start(&self, bucket: &GradBucket) -> Result<CommFuture> {
        let (state, hook) = self.handles()?;

        let invoked = self
            .runtime
            .with_lock(|token| self.runtime.invoke(token, hook, state, bucket));

        match invoked {
            Ok(fut) => {
                debug!(tensors = bucket.len(); "foreign hook launched");
                Ok(fut)
            }
            Err(e) => {
                warn!("foreign hook raised: {e}");
                Ok(CommFuture::failed(CommErr::ForeignCall(e.to_string())))
            }
        }
    }

    fn extract(&self, value: Vec<Tensor>, expected: usize) -> Result<Vec<Tensor>> {
        let (_, hook) = self.handles()?;

        let converted = self
            .runtime
            .with_lock(|token| self.runtime.convert(token, hook, value))
            .map_err(|e| HookErr::Communication(CommErr::ForeignCall(e.to_string())))?;

        expect_len(&converted, expected)?;
        Ok(converted)
    }

    fn name(&self) -> &'static str {
        "foreign"
    }
}

impl<R: ForeignRuntime> Drop for ForeignHook<R> {
    fn drop(&mut self) {
        // Taken before releasing so no handle can be released twice.
        let state = self.state.take();
        let hook = self.hook.take();

        if state.is_none() && hook.is_none() {
            return;
        }

        let runtime = &self.runtime;
        runtime.with_lock(|token| {
            if let Some(state) = state {
                runtime.release(token, state);
            }
            if let Some(hook) = hook {
                runtime.release(token, hook);
            }
        });
    }
}

impl<R: ForeignRuntime> fmt::Debug for ForeignHook<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignHook")
            .field("retained", &self.state.is_some())
            .finish()
    }
}
