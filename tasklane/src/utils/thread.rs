use crate::task::WorkerThreadType;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Generates the OS thread name of a worker from its category and its index
/// inside that category's pool.
#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(WorkerThreadType, usize) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn name(&self, kind: WorkerThreadType, index: usize) -> String {
        (self.0)(kind, index)
    }
}

impl Default for ThreadNameFn {
    fn default() -> Self {
        ThreadNameFn(Arc::new(|kind, index| {
            format!("tasklane-{}-{}", kind.label(), index)
        }))
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Best effort extraction of the message carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}
