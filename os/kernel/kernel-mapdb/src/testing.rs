//! Address spaces for unit tests.

use crate::quota::Quota;
use crate::space::Space;

#[derive(Debug)]
pub struct TaskData {
    quota: Quota,
}

/// A leaked test address space compared by identity.
#[derive(Debug, Copy, Clone)]
pub struct Task(&'static TaskData);

impl Task {
    pub fn quota(&self) -> &'static Quota {
        &self.0.quota
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl Eq for Task {}

impl Space for Task {
    type Quota = Quota;

    fn ram_quota(&self) -> &Quota {
        &self.0.quota
    }
}

pub fn task(limit: usize) -> Task {
    Task(Box::leak(Box::new(TaskData {
        quota: Quota::new(limit),
    })))
}
