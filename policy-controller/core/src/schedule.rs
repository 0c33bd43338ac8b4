use ahash::AHashMap as HashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, Instrument};

/// A unit of reconciliation work.
pub type Work = BoxFuture<'static, anyhow::Result<()>>;

/// Runs work under a key, at most one unit per key at a time.
///
/// Submitting work under a key supersedes any work previously submitted
/// under the same key that has not yet completed. Work under different keys
/// is unordered.
pub trait Schedule: Send + Sync + 'static {
    fn submit(&self, key: TaskKey, work: Work);
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum Op {
    Add,
    Update,
    Delete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TaskKey {
    op: Option<Op>,
    namespace: String,
    name: String,
}

/// Spawns each unit of work onto the tokio runtime, aborting the task it
/// supersedes.
#[derive(Clone, Debug, Default)]
pub struct TaskScheduler {
    tasks: Arc<Mutex<HashMap<TaskKey, Task>>>,
    ids: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Task {
    id: u64,
    handle: JoinHandle<()>,
}

// === impl Op ===

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => "add".fmt(f),
            Self::Update => "update".fmt(f),
            Self::Delete => "delete".fmt(f),
        }
    }
}

// === impl TaskKey ===

impl TaskKey {
    /// A key scoped to one kind of operation on a parent.
    pub fn new(op: Op, namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            op: Some(op),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// A key shared by every operation on a parent.
    pub fn parent(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            op: None,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn op(&self) -> Option<Op> {
        self.op
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(op) = self.op {
            write!(f, "{op}:")?;
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl TaskScheduler ===

impl TaskScheduler {
    /// Returns the number of tasks that have not completed.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn is_pending(&self, key: &TaskKey) -> bool {
        self.tasks.lock().contains_key(key)
    }
}

impl Schedule for TaskScheduler {
    fn submit(&self, key: TaskKey, work: Work) {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);

        // The lock is held while spawning so that the task cannot remove
        // itself before it has been recorded.
        let span = info_span!("task", %key);
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn({
            let tasks = self.tasks.clone();
            let key = key.clone();
            async move {
                if let Err(error) = work.await {
                    error!(%error, "Reconciliation failed");
                }
                let mut tasks = tasks.lock();
                if tasks.get(&key).map(|t| t.id) == Some(id) {
                    tasks.remove(&key);
                }
            }
            .instrument(span)
        });

        if let Some(superseded) = tasks.insert(key.clone(), Task { id, handle }) {
            debug!(%key, "Superseding pending task");
            superseded.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;

    #[test]
    fn key_format() {
        assert_eq!(TaskKey::new(Op::Add, "ns", "p").to_string(), "add:ns/p");
        assert_eq!(
            TaskKey::new(Op::Update, "ns", "p").to_string(),
            "update:ns/p"
        );
        assert_eq!(
            TaskKey::new(Op::Delete, "ns", "p").to_string(),
            "delete:ns/p"
        );
        assert_eq!(TaskKey::parent("ns", "p").to_string(), "ns/p");
        assert_ne!(TaskKey::new(Op::Add, "ns", "p"), TaskKey::parent("ns", "p"));
    }

    #[tokio::test]
    async fn completed_tasks_are_forgotten() {
        let scheduler = TaskScheduler::default();
        let key = TaskKey::new(Op::Add, "ns", "p");
        let (tx, rx) = oneshot::channel();
        scheduler.submit(
            key.clone(),
            async move {
                let _ = tx.send(());
                Ok(())
            }
            .boxed(),
        );
        assert!(scheduler.is_pending(&key));

        rx.await.expect("work must run");
        tokio::task::yield_now().await;
        assert!(!scheduler.is_pending(&key));
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn submission_supersedes_same_key() {
        let scheduler = TaskScheduler::default();
        let key = TaskKey::new(Op::Update, "ns", "p");

        let (_block_tx, block_rx) = oneshot::channel::<()>();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        scheduler.submit(
            key.clone(),
            async move {
                let _dropped = dropped_tx;
                let _ = block_rx.await;
                Ok(())
            }
            .boxed(),
        );

        let (done_tx, done_rx) = oneshot::channel();
        scheduler.submit(
            key.clone(),
            async move {
                let _ = done_tx.send(());
                Ok(())
            }
            .boxed(),
        );
        assert_eq!(scheduler.len(), 1);

        // The first task is dropped without ever sending.
        assert!(dropped_rx.await.is_err());
        done_rx.await.expect("latest work must run");
        tokio::task::yield_now().await;
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let scheduler = TaskScheduler::default();

        let (add_tx, add_rx) = oneshot::channel::<()>();
        let (update_tx, update_rx) = oneshot::channel::<()>();
        scheduler.submit(
            TaskKey::new(Op::Add, "ns", "p"),
            async move {
                let _ = add_tx.send(());
                Ok(())
            }
            .boxed(),
        );
        scheduler.submit(
            TaskKey::new(Op::Update, "ns", "p"),
            async move {
                let _ = update_tx.send(());
                Err(anyhow::anyhow!("update failed"))
            }
            .boxed(),
        );

        add_rx.await.expect("add must run");
        update_rx.await.expect("update must run");
        tokio::task::yield_now().await;
        assert!(scheduler.is_empty());
    }
}
