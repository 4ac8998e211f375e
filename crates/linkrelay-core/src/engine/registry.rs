//! Task registry - per-user admission and rate allocation
//!
//! The registry is the only structure shared between workers. All state
//! changes happen under one mutex that is never held across I/O; every
//! admission and release recomputes the user's rate shares in the same
//! critical section, so the per-user sum never exceeds the ceiling.

use crate::engine::rate_governor::allocate;
use crate::engine::task::Task;
use linkrelay_types::{TaskId, TaskSnapshot, TaskStatus, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct TaskRegistry {
    active: Mutex<HashMap<UserId, Vec<Arc<Task>>>>,
    max_per_user: usize,
    user_rate_limit: u64,
}

impl TaskRegistry {
    pub fn new(max_per_user: usize, user_rate_limit: u64) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            max_per_user,
            user_rate_limit,
        }
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Advisory only; [`admit`](Self::admit) re-checks under the lock
    pub fn can_admit(&self, user: &UserId) -> bool {
        self.active_count(user) < self.max_per_user
    }

    /// Insert `task` and promote it to `downloading` if the user has a free
    /// slot. A rejected task leaves no trace.
    pub fn admit(&self, task: Arc<Task>) -> bool {
        let mut active = self.active.lock();
        let tasks = active.entry(task.user_id.clone()).or_default();

        if tasks.len() >= self.max_per_user {
            if tasks.is_empty() {
                active.remove(&task.user_id);
            }
            return false;
        }

        task.set_status(TaskStatus::Downloading);
        tasks.push(task);
        self.reallocate(tasks);
        true
    }

    /// Remove a task. Calling this again for the same task is a no-op.
    pub fn release(&self, user: &UserId, task_id: &TaskId) -> bool {
        let mut active = self.active.lock();
        let Some(tasks) = active.get_mut(user) else {
            return false;
        };

        let before = tasks.len();
        tasks.retain(|t| &t.task_id != task_id);
        if tasks.len() == before {
            return false;
        }

        if tasks.is_empty() {
            active.remove(user);
        } else {
            self.reallocate(tasks);
        }
        true
    }

    pub fn active(&self, user: &UserId) -> Vec<TaskSnapshot> {
        self.active
            .lock()
            .get(user)
            .map(|tasks| tasks.iter().map(|t| t.snapshot()).collect())
            .unwrap_or_default()
    }

    pub fn active_count(&self, user: &UserId) -> usize {
        self.active.lock().get(user).map_or(0, Vec::len)
    }

    pub fn total_active(&self) -> usize {
        self.active.lock().values().map(Vec::len).sum()
    }

    fn reallocate(&self, tasks: &[Arc<Task>]) {
        let share = allocate(tasks.len(), self.user_rate_limit);
        for task in tasks {
            task.rate_share().set(share);
        }
        debug!(
            "Reallocated {} B/s across {} transfers ({} B/s each)",
            self.user_rate_limit,
            tasks.len(),
            share
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    fn task(user: &str) -> Arc<Task> {
        let user = UserId::from(user);
        let id = TaskId::new(&user, SEQ.fetch_add(1, Ordering::Relaxed));
        Arc::new(Task::new(id, user, "https://host/file.bin", "file.bin"))
    }

    #[test]
    fn test_rate_fairness() {
        let registry = TaskRegistry::new(2, 10);
        let a = task("u");
        let b = task("u");

        assert!(registry.admit(a.clone()));
        assert_eq!(a.rate_share().get(), 10);

        assert!(registry.admit(b.clone()));
        assert_eq!(a.rate_share().get(), 5);
        assert_eq!(b.rate_share().get(), 5);

        // Rejection changes nothing
        let c = task("u");
        assert!(!registry.admit(c.clone()));
        assert_eq!(c.status(), TaskStatus::Queued);
        assert_eq!(registry.active_count(&UserId::from("u")), 2);
        assert_eq!(a.rate_share().get(), 5);

        assert!(registry.release(&a.user_id, &a.task_id));
        assert_eq!(b.rate_share().get(), 10);
    }

    #[test]
    fn test_admission_promotes_to_downloading() {
        let registry = TaskRegistry::new(1, 0);
        let a = task("u");
        assert!(registry.can_admit(&a.user_id));
        assert!(registry.admit(a.clone()));
        assert_eq!(a.status(), TaskStatus::Downloading);
        assert!(!registry.can_admit(&a.user_id));
    }

    #[test]
    fn test_users_are_independent() {
        let registry = TaskRegistry::new(1, 100);
        assert!(registry.admit(task("alice")));
        assert!(registry.admit(task("bob")));
        assert!(!registry.admit(task("alice")));
        assert_eq!(registry.total_active(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = TaskRegistry::new(2, 10);
        let a = task("u");
        registry.admit(a.clone());

        assert!(registry.release(&a.user_id, &a.task_id));
        assert!(!registry.release(&a.user_id, &a.task_id));
        assert!(!registry.release(&UserId::from("nobody"), &a.task_id));
        assert_eq!(registry.total_active(), 0);
        assert!(registry.active(&a.user_id).is_empty());
    }

    #[test]
    fn test_zero_limit_rejects_without_entry() {
        let registry = TaskRegistry::new(0, 10);
        assert!(!registry.admit(task("u")));
        assert_eq!(registry.total_active(), 0);
        assert!(registry.active.lock().is_empty());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let registry = Arc::new(TaskRegistry::new(3, 300));
        let peak = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let t = task("shared");
                        if registry.admit(t.clone()) {
                            let count = registry.active_count(&t.user_id) as u64;
                            peak.fetch_max(count, Ordering::Relaxed);

                            let rates: u64 = registry
                                .active(&t.user_id)
                                .iter()
                                .map(|s| s.allocated_rate)
                                .sum();
                            assert!(rates <= 300);

                            assert!(registry.release(&t.user_id, &t.task_id));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::Relaxed) <= 3);
        assert_eq!(registry.total_active(), 0);
    }
}
