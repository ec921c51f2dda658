//! Process-wide named async locks.
//!
//! A [`LockTable`] maps a string name to a fair (FIFO) async mutex. Holding a
//! [`NamedLockGuard`] grants exclusive access to the logical resource the name
//! stands for; dropping the guard (or calling [`NamedLockGuard::release`])
//! wakes the next waiter in request order.
//!
//! The locks are not reentrant. A task that requests a name it already holds
//! waits forever. Transactions spanning several names must take them with
//! [`LockTable::acquire_all`], which grants them in a fixed order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Entries = HashMap<String, Arc<AsyncMutex<()>>>;

/// Table of named async locks. Cloning shares the table.
#[derive(Clone, Default)]
pub struct LockTable {
    entries: Arc<Mutex<Entries>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("lock table mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Wait until `name` is free, then hold it until the guard is dropped.
    pub async fn acquire(&self, name: &str) -> NamedLockGuard {
        let mutex = self
            .entries()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;
        NamedLockGuard {
            name: name.to_string(),
            table: self.clone(),
            guard: Some(guard),
        }
    }

    /// Acquire several names for one transaction. Names are granted in sorted
    /// order so two composite transactions can never wait on each other.
    /// Duplicate names are taken once.
    pub async fn acquire_all(&self, names: &[&str]) -> Vec<NamedLockGuard> {
        let mut ordered: Vec<&str> = names.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for name in ordered {
            guards.push(self.acquire(name).await);
        }
        guards
    }

    /// True while some task holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.entries()
            .get(name)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Number of names with a holder or waiters.
    pub fn active_names(&self) -> usize {
        self.entries().len()
    }

    fn prune(&self, name: &str) {
        let mut entries = self.entries();
        // Only the table's own reference left: nobody holds or waits.
        if let Some(mutex) = entries.get(name)
            && Arc::strong_count(mutex) == 1
        {
            entries.remove(name);
        }
    }
}

/// Exclusive hold on one lock name.
pub struct NamedLockGuard {
    name: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.prune(&self.name);
    }
}

impl std::fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquirer_waits_for_release() {
        let table = LockTable::new();
        let first = table.acquire("users").await;
        assert!(table.is_held("users"));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire("users").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.release();
        let second = waiter.await.unwrap();
        assert_eq!(second.name(), "users");
    }

    #[tokio::test]
    async fn critical_sections_run_in_request_order() {
        let table = LockTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let holder = table.acquire("users").await;

        let mut tasks = Vec::new();
        for i in 0..5 {
            let table = table.clone();
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = table.acquire("users").await;
                log.lock().unwrap().push(format!("enter-{i}"));
                tokio::task::yield_now().await;
                log.lock().unwrap().push(format!("exit-{i}"));
            }));
            // Let each task enqueue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("enter-{i}"), format!("exit-{i}")])
            .collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn distinct_names_do_not_block() {
        let table = LockTable::new();
        let _users = table.acquire("users").await;
        let vaults = tokio::time::timeout(Duration::from_millis(100), table.acquire("vaults"))
            .await
            .expect("independent name should be granted immediately");
        assert_eq!(vaults.name(), "vaults");
    }

    #[tokio::test]
    async fn acquire_all_orders_and_dedups() {
        let table = LockTable::new();
        let guards = table.acquire_all(&["vaults", "users", "vaults"]).await;
        let names: Vec<&str> = guards.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["users", "vaults"]);
        assert!(table.is_held("users"));
        assert!(table.is_held("vaults"));
    }

    #[tokio::test]
    async fn released_names_are_pruned() {
        let table = LockTable::new();
        {
            let _a = table.acquire("a").await;
            let _b = table.acquire("b").await;
            assert_eq!(table.active_names(), 2);
        }
        assert_eq!(table.active_names(), 0);
        assert!(!table.is_held("a"));
    }
}
