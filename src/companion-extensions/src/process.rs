//! Out-of-process extension runtime.
//!
//! The package entry is an executable started once per load. The host writes
//! one JSON request per line to its stdin:
//!
//! ```json
//! {"id":3,"hook":"on_user_message","args":"good morning"}
//! ```
//!
//! and reads JSON lines from its stdout. Besides exactly one `result` per
//! request, the child may send `log`, `ai_context` and `suppress_passive`
//! messages at any time:
//!
//! ```json
//! {"type":"log","level":"warn","message":"cache is stale"}
//! {"type":"ai_context","message":"It is raining"}
//! {"type":"suppress_passive","seconds":2.0}
//! {"type":"result","id":3,"ok":true,"value":null}
//! {"type":"result","id":3,"ok":false,"error":"no network"}
//! ```
//!
//! Anything the child writes to stderr lands in its log at `warn`.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wait_timeout::ChildExt;

use crate::Result;
use crate::config::HOOK_TIMEOUT_MS_MAX;
use crate::context::ExtensionContext;
use crate::error::{HookError, HookResult};
use crate::extension::{AiContext, Extension, ExtensionPanel, PanelHandle};
use crate::logs::LogLevel;
use crate::manifest::PackageDescriptor;
use crate::module::{ExtensionModule, ModuleLoader};

/// How long a child gets to exit after stdin closes before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Hooks sent regardless of the advertised hook set.
const ALWAYS_SENT: [&str; 2] = ["on_load", "on_unload"];

/// Host to child request.
#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    hook: &'a str,
    args: Value,
}

/// Child to host message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChildMessage {
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    AiContext {
        message: String,
    },
    SuppressPassive {
        seconds: f64,
    },
    Result(Reply),
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Loader for the `process` runtime.
#[derive(Debug, Clone)]
pub struct ProcessLoader {
    default_timeout_ms: u64,
}

impl ProcessLoader {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self { default_timeout_ms }
    }

    fn timeout_for(&self, descriptor: &PackageDescriptor) -> u64 {
        descriptor
            .timeout_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, HOOK_TIMEOUT_MS_MAX)
    }
}

impl ModuleLoader for ProcessLoader {
    fn load(&self, descriptor: &PackageDescriptor) -> Result<ExtensionModule> {
        let program = descriptor.entry_path();
        let root_dir = descriptor.root_dir.clone();
        let timeout_ms = self.timeout_for(descriptor);
        Ok(ExtensionModule::new(descriptor.entry.clone()).with_factory(move |context| {
            let process = ProcessExtension::spawn(&program, &root_dir, timeout_ms, context)?;
            Ok(Box::new(process) as Box<dyn Extension>)
        }))
    }
}

/// Pipe to one running child.
struct Connection {
    child: Child,
    stdin: Option<ChildStdin>,
    replies: flume::Receiver<Reply>,
    next_id: u64,
    timeout_ms: u64,
    closed: bool,
}

impl Connection {
    fn request(&mut self, hook: &str, args: Value) -> HookResult<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| HookError::Protocol("extension process is closed".to_string()))?;
        let line = serde_json::to_string(&Request { id, hook, args })
            .map_err(|e| HookError::Protocol(e.to_string()))?;
        writeln!(stdin, "{line}")?;
        stdin.flush()?;

        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) => {
                    if reply.id.is_some_and(|reply_id| reply_id != id) {
                        tracing::debug!(hook, "Discarding stale extension reply {:?}", reply.id);
                        continue;
                    }
                    return if reply.ok {
                        Ok(reply.value)
                    } else {
                        Err(HookError::Failed(
                            reply.error.unwrap_or_else(|| "unspecified error".to_string()),
                        ))
                    };
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    return Err(HookError::Timeout {
                        hook: hook.to_string(),
                        timeout_ms: self.timeout_ms,
                    });
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    return Err(HookError::Protocol(format!(
                        "extension process exited while handling {hook}"
                    )));
                }
            }
        }
    }

    /// Close stdin, give the child a moment to exit, then kill it.
    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stdin.take();

        if let Ok(Some(_)) = self.child.wait_timeout(SHUTDOWN_GRACE) {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An extension running as a child process.
pub struct ProcessExtension {
    connection: Arc<Mutex<Connection>>,
    hooks: Option<HashSet<String>>,
}

impl ProcessExtension {
    /// Start `program` and wire its output to `context`.
    pub fn spawn(
        program: &Path,
        root_dir: &Path,
        timeout_ms: u64,
        context: &ExtensionContext,
    ) -> HookResult<Self> {
        let mut child = Command::new(program)
            .current_dir(root_dir)
            .env("COMPANION_EXTENSION_ID", context.extension_id())
            .env("COMPANION_EXTENSION_DATA", context.storage_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HookError::Failed(format!("failed to start {}: {e}", program.display())))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = flume::unbounded();

        let mut connection = Connection {
            child,
            stdin,
            replies: rx,
            next_id: 0,
            timeout_ms,
            closed: false,
        };

        if let Err(e) = spawn_readers(context, stdout, stderr, tx) {
            connection.shutdown();
            return Err(e.into());
        }

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            hooks: None,
        })
    }

    /// Whether `hook` is in the advertised hook set.
    pub fn supports(&self, hook: &str) -> bool {
        ALWAYS_SENT.contains(&hook)
            || self
                .hooks
                .as_ref()
                .is_none_or(|hooks| hooks.contains(hook))
    }

    fn call(&mut self, hook: &str, args: Value) -> HookResult<Value> {
        if !self.supports(hook) {
            return Ok(Value::Null);
        }
        self.connection.lock().request(hook, args)
    }
}

fn spawn_readers(
    context: &ExtensionContext,
    stdout: Option<impl Read + Send + 'static>,
    stderr: Option<impl Read + Send + 'static>,
    replies: flume::Sender<Reply>,
) -> std::io::Result<()> {
    let id = context.extension_id().to_string();
    if let Some(stdout) = stdout {
        let context = context.clone();
        std::thread::Builder::new()
            .name(format!("ext-{id}-stdout"))
            .spawn(move || read_messages(stdout, &context, &replies))?;
    }
    if let Some(stderr) = stderr {
        let context = context.clone();
        std::thread::Builder::new()
            .name(format!("ext-{id}-stderr"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    context.warn(line.trim_end());
                }
            })?;
    }
    Ok(())
}

fn read_messages(stdout: impl Read, context: &ExtensionContext, replies: &flume::Sender<Reply>) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChildMessage>(line) {
            Ok(ChildMessage::Log { level, message }) => {
                let level = level
                    .as_deref()
                    .and_then(LogLevel::parse)
                    .unwrap_or(LogLevel::Info);
                context.log(level, &message);
            }
            Ok(ChildMessage::AiContext { message }) => context.add_ai_context(&message),
            Ok(ChildMessage::SuppressPassive { seconds }) => {
                context.suppress_passive_output(seconds)
            }
            Ok(ChildMessage::Result(reply)) => {
                if replies.send(reply).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(extension = %context.extension_id(), "Unparseable output: {}", e);
                context.warn(&format!("unparseable output: {line}"));
            }
        }
    }
}

impl Extension for ProcessExtension {
    fn on_load(&mut self, context: &ExtensionContext) -> HookResult {
        let value = self.call(
            "on_load",
            json!({
                "extension_id": context.extension_id(),
                "root_dir": context.root_dir(),
                "base_dir": context.base_dir(),
                "storage_dir": context.storage_dir(),
            }),
        )?;
        if let Some(hooks) = value.get("hooks").and_then(Value::as_array) {
            self.hooks = Some(
                hooks
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            );
        }
        Ok(())
    }

    fn on_unload(&mut self) -> HookResult {
        let result = self.call("on_unload", Value::Null);
        self.connection.lock().shutdown();
        result.map(|_| ())
    }

    fn on_app_start(&mut self) -> HookResult {
        self.call("on_app_start", Value::Null).map(|_| ())
    }

    fn on_app_ready(&mut self) -> HookResult {
        self.call("on_app_ready", Value::Null).map(|_| ())
    }

    fn on_settings(&mut self, settings: &Value) -> HookResult {
        self.call("on_settings", settings.clone()).map(|_| ())
    }

    fn on_state(&mut self, state: &Value) -> HookResult {
        self.call("on_state", state.clone()).map(|_| ())
    }

    fn on_tick(&mut self, state: &Value, now: DateTime<Utc>) -> HookResult {
        self.call("on_tick", json!({ "state": state, "now": now.to_rfc3339() }))
            .map(|_| ())
    }

    fn on_user_message(&mut self, text: &str) -> HookResult {
        self.call("on_user_message", Value::from(text)).map(|_| ())
    }

    fn on_ai_reply(&mut self, text: &str) -> HookResult {
        self.call("on_ai_reply", Value::from(text)).map(|_| ())
    }

    fn on_passive_message(&mut self, text: &str) -> HookResult {
        self.call("on_passive_message", Value::from(text)).map(|_| ())
    }

    fn get_ai_context(&mut self, user_text: &str) -> HookResult<AiContext> {
        self.call("get_ai_context", Value::from(user_text))
            .map(AiContext::from_value)
    }

    fn should_block_passive(&mut self, reason: &str) -> HookResult<bool> {
        let value = self.call("should_block_passive", Value::from(reason))?;
        Ok(value.as_bool().unwrap_or(false))
    }

    fn get_panel(&mut self, parent: &Value) -> HookResult<Option<PanelHandle>> {
        let value = self.call("get_panel", parent.clone())?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(Arc::new(JsonPanel {
            value,
            connection: Arc::downgrade(&self.connection),
            send_close: self.supports("close_panel"),
        })))
    }
}

/// Panel description returned by an out-of-process extension.
pub struct JsonPanel {
    value: Value,
    connection: Weak<Mutex<Connection>>,
    send_close: bool,
}

impl JsonPanel {
    /// The panel description as sent by the extension.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl ExtensionPanel for JsonPanel {
    fn close(&self) -> HookResult {
        if !self.send_close {
            return Ok(());
        }
        let Some(connection) = self.connection.upgrade() else {
            return Ok(());
        };
        let mut connection = connection.lock();
        connection.request("close_panel", self.value.clone()).map(|_| ())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
