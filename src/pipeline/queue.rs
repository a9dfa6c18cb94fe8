//! Task queues for distributed execution
//!
//! The orchestrator pushes serialized chunk tasks; workers lease one at a
//! time, execute it, and either complete or fail the lease. A queue is
//! drained when nothing is pending or leased.

use crate::io::error::{Result, fs_error, storage_error};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A task handed to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Queue-assigned identifier
    pub id: String,
    /// Serialized task
    pub payload: String,
}

/// A task a worker gave up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Identifier of the failed lease
    pub id: String,
    /// Serialized task as it was leased
    pub payload: String,
    /// Why the worker gave up
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.reason)
    }
}

/// Work queue shared by the orchestrator and its workers
pub trait TaskQueue: Send + Sync {
    /// Add a serialized task
    ///
    /// # Errors
    ///
    /// Returns a storage error if the task cannot be persisted
    fn enqueue(&self, payload: &str) -> Result<()>;

    /// Take the oldest pending task, if any
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be read
    fn lease(&self) -> Result<Option<Lease>>;

    /// Remove a finished task
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lease cannot be released
    fn complete(&self, lease: &Lease) -> Result<()>;

    /// Move a task to the failed set with a reason
    ///
    /// # Errors
    ///
    /// Returns a storage error if the failure cannot be recorded
    fn fail(&self, lease: &Lease, reason: &str) -> Result<()>;

    /// Tasks pending or leased
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be read
    fn outstanding(&self) -> Result<usize>;

    /// Every failed task with its payload and reason, oldest first
    ///
    /// Failures persist across runs; callers decide which ones concern them.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the failed set cannot be read
    fn failures(&self) -> Result<Vec<Failure>>;

    /// Whether nothing is pending or leased
    ///
    /// # Errors
    ///
    /// Returns a storage error if the queue cannot be read
    fn is_drained(&self) -> Result<bool> {
        Ok(self.outstanding()? == 0)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    pending: VecDeque<(String, String)>,
    leased: HashMap<String, String>,
    failed: Vec<Failure>,
}

/// Queue shared between threads of one process
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| storage_error("lock queue", "<memory>", &e))
    }
}

impl TaskQueue for MemoryQueue {
    fn enqueue(&self, payload: &str) -> Result<()> {
        let mut state = self.state()?;
        let id = format!("{:08}", state.next_id);
        state.next_id += 1;
        state.pending.push_back((id, payload.to_string()));
        Ok(())
    }

    fn lease(&self) -> Result<Option<Lease>> {
        let mut state = self.state()?;
        let Some((id, payload)) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.leased.insert(id.clone(), payload.clone());
        Ok(Some(Lease { id, payload }))
    }

    fn complete(&self, lease: &Lease) -> Result<()> {
        self.state()?.leased.remove(&lease.id);
        Ok(())
    }

    fn fail(&self, lease: &Lease, reason: &str) -> Result<()> {
        let mut state = self.state()?;
        state.leased.remove(&lease.id);
        state.failed.push(Failure {
            id: lease.id.clone(),
            payload: lease.payload.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn outstanding(&self) -> Result<usize> {
        let state = self.state()?;
        Ok(state.pending.len() + state.leased.len())
    }

    fn failures(&self) -> Result<Vec<Failure>> {
        Ok(self.state()?.failed.clone())
    }
}

/// Queue of JSON files under a shared directory
///
/// Tasks move `pending/ -> leased/ -> (removed | failed/)` by rename, so
/// several worker processes can lease from one directory without locking.
#[derive(Debug)]
pub struct DirectoryQueue {
    root: PathBuf,
    counter: AtomicU64,
}

const PENDING: &str = "pending";
const LEASED: &str = "leased";
const FAILED: &str = "failed";

impl DirectoryQueue {
    /// Open or create a queue rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns a file system error if the queue directories cannot be created
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [PENDING, LEASED, FAILED] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| fs_error(&path, "create queue dir", e))?;
        }
        Ok(Self {
            root,
            counter: AtomicU64::new(0),
        })
    }

    /// Queue root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries(&self, dir: &str, extension: &str) -> Result<Vec<String>> {
        let path = self.root.join(dir);
        let mut names: Vec<String> = std::fs::read_dir(&path)
            .map_err(|e| fs_error(&path, "list queue", e))?
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| Path::new(name).extension().is_some_and(|ext| ext == extension))
            .collect();
        names.sort_unstable();
        Ok(names)
    }

    fn next_name(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:024}-{}-{count:08}.json", std::process::id())
    }
}

impl TaskQueue for DirectoryQueue {
    fn enqueue(&self, payload: &str) -> Result<()> {
        let name = self.next_name();
        let staging = self.root.join(format!("{name}.partial"));
        std::fs::write(&staging, payload).map_err(|e| fs_error(&staging, "write task", e))?;
        let target = self.root.join(PENDING).join(&name);
        std::fs::rename(&staging, &target).map_err(|e| fs_error(&target, "enqueue task", e))
    }

    fn lease(&self) -> Result<Option<Lease>> {
        for name in self.entries(PENDING, "json")? {
            let from = self.root.join(PENDING).join(&name);
            let to = self.root.join(LEASED).join(&name);
            match std::fs::rename(&from, &to) {
                Ok(()) => {
                    let payload = std::fs::read_to_string(&to).map_err(|e| fs_error(&to, "read task", e))?;
                    debug!(task = %name, "leased");
                    return Ok(Some(Lease { id: name, payload }));
                }
                // Another worker won the race for this file
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(fs_error(&from, "lease task", e)),
            }
        }
        Ok(None)
    }

    fn complete(&self, lease: &Lease) -> Result<()> {
        let path = self.root.join(LEASED).join(&lease.id);
        std::fs::remove_file(&path).map_err(|e| fs_error(&path, "complete task", e))
    }

    fn fail(&self, lease: &Lease, reason: &str) -> Result<()> {
        let from = self.root.join(LEASED).join(&lease.id);
        let to = self.root.join(FAILED).join(&lease.id);
        // The reason lands first so a listed failure always has one
        let note = to.with_extension("reason");
        std::fs::write(&note, reason).map_err(|e| fs_error(&note, "record failure", e))?;
        std::fs::rename(&from, &to).map_err(|e| fs_error(&from, "fail task", e))?;
        warn!(task = %lease.id, reason, "task failed");
        Ok(())
    }

    fn outstanding(&self) -> Result<usize> {
        Ok(self.entries(PENDING, "json")?.len() + self.entries(LEASED, "json")?.len())
    }

    fn failures(&self) -> Result<Vec<Failure>> {
        let read = |path: &Path, operation: &'static str| {
            std::fs::read_to_string(path).map_err(|e| fs_error(path, operation, e))
        };
        self.entries(FAILED, "json")?
            .into_iter()
            .map(|id| {
                let task = self.root.join(FAILED).join(&id);
                Ok(Failure {
                    payload: read(&task, "read failed task")?,
                    reason: read(&task.with_extension("reason"), "read failure")?,
                    id,
                })
            })
            .collect()
    }
}
