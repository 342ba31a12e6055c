use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::Result;
use crate::index::Index;

/// One in-flight rebuild of a root, shared by the caller running it and
/// every caller that arrives while it runs.
#[derive(Default)]
pub(super) struct Flight {
    result: Mutex<Option<Result<Arc<Index>>>>,
    done: Condvar,
}

impl Flight {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the rebuild finishes and return its outcome
    pub(super) fn wait(&self) -> Result<Arc<Index>> {
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut result);
        }
    }

    pub(super) fn complete(&self, outcome: Result<Arc<Index>>) {
        *self.result.lock() = Some(outcome);
        self.done.notify_all();
    }
}
