#![allow(dead_code)]

use kernel_mapdb::{Mapdb, Order, Quota, Space};

#[derive(Debug)]
pub struct TaskData {
    pub name: &'static str,
    pub quota: Quota,
}

/// A leaked address space, compared by identity.
#[derive(Copy, Clone)]
pub struct Task(&'static TaskData);

impl Task {
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self(Box::leak(Box::new(TaskData {
            name,
            quota: Quota::new(limit),
        })))
    }

    pub fn unlimited(name: &'static str) -> Self {
        Self::new(name, usize::MAX)
    }

    pub fn used(&self) -> usize {
        self.0.quota.used()
    }

    pub fn limit(&self) -> usize {
        self.0.quota.limit()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0.name)
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

/// 1 GiB / 2 MiB / 4 KiB over 64 GiB of physical memory.
pub fn x86_64_db(sigma0: Task) -> Mapdb<Task> {
    Mapdb::new(
        sigma0,
        Order::new(36),
        &kernel_mapdb::config::X86_64_PAGE_SHIFTS,
    )
    .unwrap()
}
