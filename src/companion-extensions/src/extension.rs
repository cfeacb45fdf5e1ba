//! Hook interface implemented by extension instances.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::context::ExtensionContext;
use crate::error::HookResult;

/// Context returned by the pull-style `get_ai_context` hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AiContext {
    #[default]
    None,
    Text(String),
    Lines(Vec<String>),
}

impl AiContext {
    /// Trimmed, non-blank lines.
    pub fn into_lines(self) -> Vec<String> {
        let lines = match self {
            Self::None => Vec::new(),
            Self::Text(text) => vec![text],
            Self::Lines(lines) => lines,
        };
        lines
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Interpret a JSON value: a string, an array of strings or nothing.
    ///
    /// Non-string array items are skipped.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            Value::Array(items) => Self::Lines(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(text) => Some(text),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => Self::None,
        }
    }
}

impl From<String> for AiContext {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for AiContext {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<String>> for AiContext {
    fn from(lines: Vec<String>) -> Self {
        Self::Lines(lines)
    }
}

/// Opaque UI panel produced by an extension.
///
/// The host downcasts through [`ExtensionPanel::as_any`] to the concrete type
/// its UI layer understands.
pub trait ExtensionPanel: Send + Sync {
    /// Close the panel. Called by the runtime before the owning extension
    /// unloads.
    fn close(&self) -> HookResult {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Shared panel handle.
pub type PanelHandle = Arc<dyn ExtensionPanel>;

/// An extension instance.
///
/// Every hook has a no-op default; implement only the ones the extension
/// cares about.
#[allow(unused_variables)]
pub trait Extension: Send {
    /// Called once after the instance is resolved.
    fn on_load(&mut self, context: &ExtensionContext) -> HookResult {
        Ok(())
    }

    /// Called once before the instance is dropped.
    fn on_unload(&mut self) -> HookResult {
        Ok(())
    }

    fn on_app_start(&mut self) -> HookResult {
        Ok(())
    }

    fn on_app_ready(&mut self) -> HookResult {
        Ok(())
    }

    fn on_settings(&mut self, settings: &Value) -> HookResult {
        Ok(())
    }

    fn on_state(&mut self, state: &Value) -> HookResult {
        Ok(())
    }

    fn on_tick(&mut self, state: &Value, now: DateTime<Utc>) -> HookResult {
        Ok(())
    }

    fn on_user_message(&mut self, text: &str) -> HookResult {
        Ok(())
    }

    fn on_ai_reply(&mut self, text: &str) -> HookResult {
        Ok(())
    }

    fn on_passive_message(&mut self, text: &str) -> HookResult {
        Ok(())
    }

    /// Context to add to the AI prompt for `user_text`.
    fn get_ai_context(&mut self, user_text: &str) -> HookResult<AiContext> {
        Ok(AiContext::None)
    }

    /// Whether passive host output should be held back right now.
    fn should_block_passive(&mut self, reason: &str) -> HookResult<bool> {
        Ok(false)
    }

    /// Build a UI panel under `parent`.
    fn get_panel(&mut self, parent: &Value) -> HookResult<Option<PanelHandle>> {
        Ok(None)
    }
}

/// Events fanned out to every enabled and loaded extension.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    AppStart,
    AppReady,
    Settings(Value),
    State(Value),
    Tick { state: Value, now: DateTime<Utc> },
    UserMessage(String),
    AiReply(String),
    PassiveMessage(String),
}

impl HookEvent {
    /// All fan-out hook names.
    pub const NAMES: [&'static str; 8] = [
        "on_app_start",
        "on_app_ready",
        "on_settings",
        "on_state",
        "on_tick",
        "on_user_message",
        "on_ai_reply",
        "on_passive_message",
    ];

    /// Hook name as seen by packages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppStart => "on_app_start",
            Self::AppReady => "on_app_ready",
            Self::Settings(_) => "on_settings",
            Self::State(_) => "on_state",
            Self::Tick { .. } => "on_tick",
            Self::UserMessage(_) => "on_user_message",
            Self::AiReply(_) => "on_ai_reply",
            Self::PassiveMessage(_) => "on_passive_message",
        }
    }

    /// Build an event from a hook name and a JSON payload.
    ///
    /// `on_tick` takes `{"state": ..., "now": "<rfc3339>"}` (missing `now`
    /// means the current time); message hooks take a string; snapshot hooks
    /// take any value.
    pub fn from_parts(hook: &str, payload: Value) -> Option<Self> {
        let text = |payload: Value| match payload {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Some(match hook {
            "on_app_start" => Self::AppStart,
            "on_app_ready" => Self::AppReady,
            "on_settings" => Self::Settings(payload),
            "on_state" => Self::State(payload),
            "on_tick" => {
                let now = payload
                    .get("now")
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                let state = payload.get("state").cloned().unwrap_or(Value::Null);
                Self::Tick { state, now }
            }
            "on_user_message" => Self::UserMessage(text(payload)),
            "on_ai_reply" => Self::AiReply(text(payload)),
            "on_passive_message" => Self::PassiveMessage(text(payload)),
            _ => return None,
        })
    }

    /// JSON arguments, in the shape [`HookEvent::from_parts`] accepts.
    pub fn args(&self) -> Value {
        match self {
            Self::AppStart | Self::AppReady => Value::Null,
            Self::Settings(value) | Self::State(value) => value.clone(),
            Self::Tick { state, now } => serde_json::json!({
                "state": state,
                "now": now.to_rfc3339(),
            }),
            Self::UserMessage(text) | Self::AiReply(text) | Self::PassiveMessage(text) => {
                Value::String(text.clone())
            }
        }
    }

    /// Call the matching hook on `extension`.
    pub fn deliver(&self, extension: &mut dyn Extension) -> HookResult {
        match self {
            Self::AppStart => extension.on_app_start(),
            Self::AppReady => extension.on_app_ready(),
            Self::Settings(settings) => extension.on_settings(settings),
            Self::State(state) => extension.on_state(state),
            Self::Tick { state, now } => extension.on_tick(state, *now),
            Self::UserMessage(text) => extension.on_user_message(text),
            Self::AiReply(text) => extension.on_ai_reply(text),
            Self::PassiveMessage(text) => extension.on_passive_message(text),
        }
    }
}
