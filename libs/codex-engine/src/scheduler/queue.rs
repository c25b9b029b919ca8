use codex_common::types::{JobId, TenantId};
use std::collections::{HashMap, VecDeque};

/// Per-tenant FIFO queues served round-robin.
///
/// Each tenant with waiting jobs holds one place in the rotation. `pop` serves
/// the tenant at the front and, if it still has work, sends it to the back, so
/// a tenant with a deep backlog delays others by at most one job per round.
#[derive(Debug, Default)]
pub struct FairQueue {
    queues: HashMap<TenantId, VecDeque<JobId>>,
    rotation: VecDeque<TenantId>,
    len: usize,
}

impl FairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, tenant: &TenantId, job_id: JobId) {
        let queue = self.queues.entry(tenant.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(tenant.clone());
        }
        queue.push_back(job_id);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<(TenantId, JobId)> {
        let tenant = self.rotation.pop_front()?;
        let queue = self.queues.get_mut(&tenant)?;
        let job_id = queue.pop_front()?;
        self.len -= 1;

        if queue.is_empty() {
            self.queues.remove(&tenant);
        } else {
            self.rotation.push_back(tenant.clone());
        }
        Some((tenant, job_id))
    }

    /// Take a waiting job out of the queue. Returns `false` if it was not queued.
    pub fn remove(&mut self, tenant: &TenantId, job_id: JobId) -> bool {
        let Some(queue) = self.queues.get_mut(tenant) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|id| *id == job_id) else {
            return false;
        };
        queue.remove(pos);
        self.len -= 1;

        if queue.is_empty() {
            self.queues.remove(tenant);
            self.rotation.retain(|t| t != tenant);
        }
        true
    }
}
