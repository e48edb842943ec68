//! In-process task store for tests and dry runs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::core::task::{Task, TaskState};
use crate::store::{NewTask, TaskFilter, TaskStore};
use crate::{Error, Result};

/// Tasks per store root, kept in insertion order.
#[derive(Default)]
pub struct MemoryTaskStore {
    roots: Mutex<BTreeMap<PathBuf, Vec<Task>>>,
    next_id: AtomicUsize,
    list_calls: AtomicUsize,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn roots(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, Vec<Task>>> {
        self.roots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a task under `root`.
    pub fn put(&self, root: &Path, task: Task) {
        let mut roots = self.roots();
        let tasks = roots.entry(root.to_path_buf()).or_default();
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
    }

    pub fn get(&self, root: &Path, id: &str) -> Option<Task> {
        self.roots()
            .get(root)
            .and_then(|tasks| tasks.iter().find(|t| t.id == id).cloned())
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn with_task<T>(&self, root: &Path, id: &str, f: impl FnOnce(&mut Task) -> T) -> Result<T> {
        let mut roots = self.roots();
        let task = roots
            .get_mut(root)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == id))
            .ok_or_else(|| Error::TaskStore(format!("no task {}", id)))?;
        Ok(f(task))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn init(&self, root: &Path, _prefix: &str) -> Result<()> {
        self.roots().entry(root.to_path_buf()).or_default();
        Ok(())
    }

    async fn list(&self, root: &Path, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .roots()
            .get(root)
            .map(|tasks| tasks.iter().filter(|t| filter.matches(t)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, root: &Path, new: NewTask) -> Result<Task> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut task = Task::new(&format!("mem-{}", n), &new.title)
            .with_labels(new.labels)
            .with_type(new.issue_type);
        task.description = new.description;
        self.put(root, task.clone());
        Ok(task)
    }

    async fn update(
        &self,
        root: &Path,
        id: &str,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> Result<()> {
        self.with_task(root, id, |task| {
            for label in remove_labels {
                task.labels.remove(label);
            }
            task.labels.extend(add_labels.iter().cloned());
        })
    }

    async fn close(&self, root: &Path, id: &str, _message: &str) -> Result<()> {
        self.with_task(root, id, |task| task.status = TaskState::Closed)
    }

    async fn add_dependency(&self, root: &Path, blocked: &str, blocker: &str) -> Result<()> {
        self.with_task(root, blocked, |task| {
            if !task.blocked_by.iter().any(|b| b == blocker) {
                task.blocked_by.push(blocker.to_string());
            }
        })
    }

    async fn dependents(&self, root: &Path, id: &str) -> Result<Vec<String>> {
        Ok(self
            .roots()
            .get(root)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|t| t.blocked_by.iter().any(|b| b == id))
                    .map(|t| t.id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
