//! Per-operation log records.
//!
//! Every filesystem operation owns one [`OperationLog`]. Fields are filled in as the operation
//! progresses, each at most once, and the record is emitted as a `tracing` event when it drops.
//! Dropping happens on every exit path, so early returns and panics are logged too.

use std::fmt;
use std::sync::OnceLock;

use tokio::time::Instant;
use tracing::{debug, error};

tokio::task_local! {
    /// Pid of the process that issued the request currently being served.
    pub static CALLER_PID: u32;
}

/// Outcome of an operation as reported to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation succeeded.
    Ok,
    /// The operation failed with this errno.
    Errno(i32),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Errno(code) => write!(f, "{}", nix::errno::Errno::from_raw(*code)),
        }
    }
}

/// Record of a single filesystem operation.
///
/// # Panics
///
/// Every setter panics when its field has already been set. Setting a field twice means two code
/// paths both believe they own the outcome of the operation.
pub struct OperationLog {
    name: String,
    path: Option<String>,
    args: Option<String>,
    pid: Option<u32>,
    started_at: Instant,
    error: OnceLock<String>,
    result: OnceLock<String>,
    status: OnceLock<Status>,
    cache_hit: OnceLock<bool>,
}

impl OperationLog {
    fn new(name: String, path: Option<String>, args: Option<String>) -> Self {
        Self {
            name,
            path,
            args,
            pid: CALLER_PID.try_with(|pid| *pid).ok(),
            started_at: Instant::now(),
            error: OnceLock::new(),
            result: OnceLock::new(),
            status: OnceLock::new(),
            cache_hit: OnceLock::new(),
        }
    }

    /// Start logging an operation on `path`.
    pub fn start(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(name.into(), Some(path.into()), None)
    }

    /// Start logging an operation on an open file, described by `args`.
    pub fn start_file(name: impl Into<String>, args: impl fmt::Display) -> Self {
        Self::new(format!("File {}", name.into()), None, Some(args.to_string()))
    }

    /// The operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record the error that ended the operation, with its full cause chain.
    pub fn error(&self, err: &(dyn std::error::Error + 'static)) {
        let mut rendered = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        if let Err(rendered) = self.error.set(rendered) {
            panic!(
                "err already set to '{}', can't set to '{rendered}'",
                self.error.get().map_or("", String::as_str)
            );
        }
    }

    /// Record a short description of what the operation produced.
    pub fn result(&self, result: impl fmt::Display) {
        if let Err(result) = self.result.set(result.to_string()) {
            panic!(
                "result already set to '{}', can't set to '{result}'",
                self.result.get().map_or("", String::as_str)
            );
        }
    }

    /// Record the status returned to the kernel. Returns `status` so callers can chain it.
    pub fn status(&self, status: Status) -> Status {
        if let Err(status) = self.status.set(status) {
            panic!(
                "status already set to '{}', can't set to '{status}'",
                self.status.get().map_or_else(String::new, ToString::to_string)
            );
        }
        status
    }

    /// Record that the metadata cache was consulted, and whether it answered.
    pub fn cache_used(&self, hit: bool) {
        if let Err(hit) = self.cache_hit.set(hit) {
            panic!(
                "cache hit already set to '{}', can't set to '{hit}'",
                self.cache_hit.get().copied().unwrap_or_default()
            );
        }
    }

    /// Whether the cache answered, if it was consulted.
    #[must_use]
    pub fn cache_hit(&self) -> Option<bool> {
        self.cache_hit.get().copied()
    }

    /// The recorded status, if any.
    #[must_use]
    pub fn recorded_status(&self) -> Option<Status> {
        self.status.get().copied()
    }

    /// The recorded error, if any.
    #[must_use]
    pub fn recorded_error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }
}

impl fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationLog")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl Drop for OperationLog {
    fn drop(&mut self) {
        let duration_ms =
            u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let status = self
            .status
            .get()
            .map_or_else(|| "unset".to_owned(), ToString::to_string);

        debug!(
            op = %self.name,
            duration_ms,
            status = %status,
            pid = ?self.pid,
            path = ?self.path,
            args = ?self.args,
            result = ?self.result.get(),
            cache_hit = ?self.cache_hit.get(),
            "operation finished"
        );

        if let Some(err) = self.error.get() {
            error!(
                op = %self.name,
                path = ?self.path,
                args = ?self.args,
                error = %err,
                "operation failed"
            );
        }
    }
}
