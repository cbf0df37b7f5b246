//! CPython hooks, the GIL is the execution lock.
//!
//! The Python callable is invoked as `hook(state, bucket)` and must return either a
//! `HookFuture` completed later from Python or a list of float lists.

use parking_lot::Mutex;
use pyo3::{exceptions::PyRuntimeError, prelude::*};

use super::{ForeignHook, ForeignRuntime};
use crate::{
    bucket::GradBucket,
    error::CommErr,
    future::{CommFuture, Completion},
    tensor::{self, Tensor},
};

/// The boundary into the embedded Python interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonRuntime;

impl ForeignRuntime for PythonRuntime {
    type Object = Py<PyAny>;
    type Token<'t> = Python<'t>;
    type Error = PyErr;

    fn with_lock<T>(&self, f: impl for<'t> FnOnce(Self::Token<'t>) -> T) -> T {
        Python::attach(f)
    }

    fn retain(&self, py: Python<'_>, obj: &Py<PyAny>) -> Py<PyAny> {
        obj.clone_ref(py)
    }

    fn release(&self, py: Python<'_>, obj: Py<PyAny>) {
        obj.drop_ref(py);
    }

    fn invoke(
        &self,
        py: Python<'_>,
        hook: &Py<PyAny>,
        state: &Py<PyAny>,
        bucket: &GradBucket,
    ) -> PyResult<CommFuture> {
        let bucket = Py::new(py, PyGradBucket::from(bucket))?;
        let ret = hook.bind(py).call1((state.bind(py), bucket))?;

        if let Ok(fut) = ret.extract::<PyRef<'_, PyHookFuture>>() {
            return Ok(fut.fut.clone());
        }

        let lists: Vec<Vec<f32>> = ret.extract().map_err(Into::<PyErr>::into)?;
        Ok(CommFuture::ready(to_tensors(lists)))
    }
}

/// Registers a Python communication hook.
///
/// # Arguments
/// * `state` - Passed as the first argument of every call to `hook`.
/// * `hook` - A callable taking `(state, bucket)`.
pub fn register_python_hook(state: &Py<PyAny>, hook: &Py<PyAny>) -> ForeignHook<PythonRuntime> {
    ForeignHook::new(PythonRuntime, state, hook)
}

/// Adds the classes Python hooks interact with to `module`.
pub fn add_classes(module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_class::<PyGradBucket>()?;
    module.add_class::<PyHookFuture>()?;
    Ok(())
}

/// The view of a bucket handed to Python hooks.
#[pyclass(name = "GradBucket", frozen)]
pub struct PyGradBucket {
    tensors: Vec<Tensor>,
}

impl From<&GradBucket> for PyGradBucket {
    fn from(bucket: &GradBucket) -> Self {
        Self {
            tensors: bucket.tensors().to_vec(),
        }
    }
}

#[pymethods]
impl PyGradBucket {
    /// The flattened elements of every tensor, in bucket order.
    fn get_tensors(&self) -> Vec<Vec<f32>> {
        self.tensors
            .iter()
            .map(|t| t.iter().copied().collect())
            .collect()
    }

    fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape().to_vec()).collect()
    }

    fn __len__(&self) -> usize {
        self.tensors.len()
    }
}

/// A future Python hooks return and complete whenever their work is done.
#[pyclass(name = "HookFuture", frozen)]
pub struct PyHookFuture {
    completion: Mutex<Option<Completion>>,
    fut: CommFuture,
}

#[pymethods]
impl PyHookFuture {
    #[new]
    fn new() -> Self {
        let (completion, fut) = CommFuture::pending();
        Self {
            completion: Mutex::new(Some(completion)),
            fut,
        }
    }

    fn set_result(&self, tensors: Vec<Vec<f32>>) -> PyResult<()> {
        self.take_completion()?.complete(to_tensors(tensors));
        Ok(())
    }

    fn set_exception(&self, message: String) -> PyResult<()> {
        self.take_completion()?.fail(CommErr::ForeignCall(message));
        Ok(())
    }

    fn done(&self) -> bool {
        self.fut.is_completed()
    }
}

impl PyHookFuture {
    fn take_completion(&self) -> PyResult<Completion> {
        self.completion
            .lock()
            .take()
            .ok_or_else(|| PyRuntimeError::new_err("HookFuture was already completed"))
    }
}

fn to_tensors(lists: Vec<Vec<f32>>) -> Vec<Tensor> {
    lists.into_iter().map(tensor::from_vec).collect()
}
