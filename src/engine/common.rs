// src/engine/common.rs
//
// Panic policy shared by every place that runs user-supplied code on a worker
// or the batch driver. A panic never unwinds past those loops; it becomes an
// InternalFault.

use crate::error::BatchError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Run `f`, turning a panic into `BatchError::InternalFault` tagged with `label`.
pub fn run_with_panic_policy<T, F>(label: &str, f: F) -> Result<T, BatchError>
where
    F: FnOnce() -> Result<T, BatchError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(BatchError::internal_fault(format!(
            "{label}: panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
