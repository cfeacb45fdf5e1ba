//! Extension context - the capability surface handed to package code.
//!
//! A context is created once per load and detached when the record unloads.
//! After detaching, every capability becomes a silent no-op so a package
//! holding on to a clone (for example from a background thread) cannot keep
//! writing into the host.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::logs::{LogBook, LogLevel};

/// Queue of AI prompt context contributed by packages between requests.
pub struct AiContextQueue {
    capacity: usize,
    items: Mutex<VecDeque<String>>,
}

impl AiContextQueue {
    /// Create a queue keeping at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a contribution as `[<id>] <text>`. Blank text is ignored.
    pub fn push(&self, extension_id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut items = self.items.lock();
        items.push_back(format!("[{extension_id}] {text}"));
        while items.len() > self.capacity {
            items.pop_front();
        }
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<String> {
        self.items.lock().drain(..).collect()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Host-wide passive output suppression deadline.
#[derive(Default)]
pub struct PassiveGate {
    deadline: Mutex<Option<Instant>>,
}

impl PassiveGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the deadline to at least `now + seconds`; never shortens it.
    ///
    /// Non-positive and non-finite durations are ignored.
    pub fn extend(&self, seconds: f64) {
        let Ok(duration) = Duration::try_from_secs_f64(seconds) else {
            return;
        };
        if duration.is_zero() {
            return;
        }
        let Some(candidate) = Instant::now().checked_add(duration) else {
            return;
        };
        let mut deadline = self.deadline.lock();
        *deadline = Some(match *deadline {
            Some(current) if current > candidate => current,
            _ => candidate,
        });
    }

    /// Whether the deadline is still in the future.
    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }

    /// Time left before the deadline passes.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = (*self.deadline.lock())?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }
}

/// Shared host state reachable from every context.
#[derive(Clone)]
pub struct HostServices {
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logs: Arc<LogBook>,
    pub ai_context: Arc<AiContextQueue>,
    pub passive: Arc<PassiveGate>,
}

impl HostServices {
    /// Build services from a runtime configuration.
    pub fn from_config(config: &crate::RuntimeConfig) -> Self {
        let data_dir = config.data_dir();
        Self {
            base_dir: config.base_dir.clone(),
            logs: Arc::new(LogBook::new(&data_dir, config.log_capacity)),
            ai_context: Arc::new(AiContextQueue::new(config.ai_context_capacity)),
            passive: Arc::new(PassiveGate::new()),
            data_dir,
        }
    }

    /// Private storage directory of one extension.
    pub fn storage_dir(&self, extension_id: &str) -> PathBuf {
        self.data_dir.join(crate::EXTENSION_DIR).join(extension_id)
    }
}

struct ContextInner {
    extension_id: String,
    root_dir: PathBuf,
    storage_dir: PathBuf,
    services: HostServices,
    detached: AtomicBool,
}

/// Capabilities granted to one loaded extension.
///
/// Cheap to clone; all clones share the same detach flag.
#[derive(Clone)]
pub struct ExtensionContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension_id", &self.inner.extension_id)
            .field("root_dir", &self.inner.root_dir)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl ExtensionContext {
    /// Create a context for one extension load.
    pub fn new(extension_id: &str, root_dir: &Path, services: HostServices) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                extension_id: extension_id.to_string(),
                root_dir: root_dir.to_path_buf(),
                storage_dir: services.storage_dir(extension_id),
                services,
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier of the owning extension.
    pub fn extension_id(&self) -> &str {
        &self.inner.extension_id
    }

    /// Package directory.
    pub fn root_dir(&self) -> &Path {
        &self.inner.root_dir
    }

    /// Host base directory.
    pub fn base_dir(&self) -> &Path {
        &self.inner.services.base_dir
    }

    /// Private storage directory: `<data>/extensions/<id>`.
    pub fn storage_dir(&self) -> &Path {
        &self.inner.storage_dir
    }

    /// Path inside the private storage directory, creating its parent
    /// directories.
    ///
    /// Parts that would leave the storage directory are rejected.
    pub fn data_path(&self, parts: &[&str]) -> std::io::Result<PathBuf> {
        let mut path = self.inner.storage_dir.clone();
        for part in parts {
            let part = Path::new(part);
            if part
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path part escapes extension storage: {}", part.display()),
                ));
            }
            path.push(part);
        }
        let dir = if parts.is_empty() {
            path.as_path()
        } else {
            path.parent().unwrap_or(&self.inner.storage_dir)
        };
        std::fs::create_dir_all(dir)?;
        Ok(path)
    }

    /// Write one entry to this extension's log.
    pub fn log(&self, level: LogLevel, message: &str) {
        if message.trim().is_empty() || self.is_detached() {
            return;
        }
        self.inner
            .services
            .logs
            .append(&self.inner.extension_id, level, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Queue text for the next AI prompt.
    pub fn add_ai_context(&self, message: &str) {
        if self.is_detached() {
            return;
        }
        self.inner
            .services
            .ai_context
            .push(&self.inner.extension_id, message);
    }

    /// Suppress passive host output for at least `seconds` from now.
    pub fn suppress_passive_output(&self, seconds: f64) {
        if self.is_detached() {
            return;
        }
        self.inner.services.passive.extend(seconds);
    }

    /// Whether the owning record has unloaded.
    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.inner.detached.store(true, Ordering::Release);
    }
}
