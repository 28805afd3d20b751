//! Work items: units of deferred execution handed to the worker pool.
//!
//! A work item crosses threads as a `Send` closure; the closure runs on
//! the target runtime and produces the (thread-local) future a worker then
//! drives to completion.

use std::future::Future;

use crate::task::LocalFuture;

pub struct WorkItem {
    name: &'static str,
    make: Box<dyn FnOnce() -> LocalFuture + Send>,
}

impl WorkItem {
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self {
            name,
            make: Box::new(move || Box::pin(f())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn into_future(self) -> LocalFuture {
        (self.make)()
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("name", &self.name).finish()
    }
}
