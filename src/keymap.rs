//! Maps logical key names onto the input-simulation backend.
//!
//! The backend itself (OS-level event injection) lives behind the
//! [`KeySimulator`] trait; the mapper only decides whether a logical
//! name is literal text, a named key press, or unrecognized. An
//! unrecognized name is logged and swallowed - it must never raise to
//! the caller.

use std::sync::Arc;

use tracing::{debug, warn};

/// Error raised by a simulation backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SimulatorError {
    /// The backend refused or failed to inject the input.
    #[error("input injection failed: {0}")]
    Injection(String),
}

/// Interface to the OS-level input injector.
///
/// Implementations post real events to the focused application; tests
/// use [`RecordingSimulator`].
pub trait KeySimulator: Send + Sync {
    /// Type literal text, character by character.
    fn type_text(&self, text: &str) -> Result<(), SimulatorError>;

    /// Press and release a named key (backend naming, e.g. `"enter"`).
    fn press_named(&self, name: &str) -> Result<(), SimulatorError>;

    /// Whether the backend knows `name` as a pressable key.
    fn recognizes(&self, name: &str) -> bool;
}

impl<S: KeySimulator + ?Sized> KeySimulator for &S {
    fn type_text(&self, text: &str) -> Result<(), SimulatorError> {
        (**self).type_text(text)
    }

    fn press_named(&self, name: &str) -> Result<(), SimulatorError> {
        (**self).press_named(name)
    }

    fn recognizes(&self, name: &str) -> bool {
        (**self).recognizes(name)
    }
}

impl<S: KeySimulator + ?Sized> KeySimulator for Arc<S> {
    fn type_text(&self, text: &str) -> Result<(), SimulatorError> {
        (**self).type_text(text)
    }

    fn press_named(&self, name: &str) -> Result<(), SimulatorError> {
        (**self).press_named(name)
    }

    fn recognizes(&self, name: &str) -> bool {
        (**self).recognizes(name)
    }
}

/// Fixed translation from transport-level logical names to backend key
/// names. Case-sensitive; unlisted names pass through unchanged.
const KEY_MAP: &[(&str, &str)] = &[
    ("Backspace", "backspace"),
    ("Enter", "enter"),
    ("Space", "space"),
    ("Tab", "tab"),
    ("Escape", "esc"),
    ("ArrowUp", "up"),
    ("ArrowDown", "down"),
    ("ArrowLeft", "left"),
    ("ArrowRight", "right"),
];

/// Translates logical key names and text blocks into the two backend
/// primitives.
pub struct KeyMapper<S> {
    sim: S,
}

impl<S: KeySimulator> KeyMapper<S> {
    /// Wrap a simulation backend.
    pub fn new(sim: S) -> Self {
        Self { sim }
    }

    /// Type a block of text verbatim. No-op on the empty string.
    pub fn type_text(&self, text: &str) -> Result<(), SimulatorError> {
        if text.is_empty() {
            return Ok(());
        }
        self.sim.type_text(text)
    }

    /// Press a key by its logical name.
    ///
    /// Resolution: map the name through the fixed table; a single
    /// character is typed as literal text, a backend-recognized name is
    /// pressed, anything else is logged and dropped. Only backend
    /// injection failures surface as errors.
    pub fn press_key(&self, logical: &str) -> Result<(), SimulatorError> {
        let mapped = KEY_MAP
            .iter()
            .find(|(from, _)| *from == logical)
            .map_or(logical, |(_, to)| *to);

        if mapped.chars().count() == 1 {
            self.sim.type_text(mapped)
        } else if self.sim.recognizes(mapped) {
            self.sim.press_named(mapped)
        } else {
            warn!(key = logical, "unrecognized key ignored");
            Ok(())
        }
    }
}

/// Backend key names a typical injector understands. Used by the
/// logging and recording simulators; real backends answer from their
/// own tables.
const RECOGNIZED_KEYS: &[&str] = &[
    "backspace", "delete", "enter", "space", "tab", "esc", "up", "down", "left", "right", "home",
    "end", "pageup", "pagedown", "capslock", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9",
    "f10", "f11", "f12",
];

/// Simulator that only logs what it would inject. Stands in where no
/// OS backend is wired up.
#[derive(Default)]
pub struct LoggingSimulator;

impl KeySimulator for LoggingSimulator {
    fn type_text(&self, text: &str) -> Result<(), SimulatorError> {
        debug!(len = text.len(), "type_text");
        Ok(())
    }

    fn press_named(&self, name: &str) -> Result<(), SimulatorError> {
        debug!(key = name, "press_named");
        Ok(())
    }

    fn recognizes(&self, name: &str) -> bool {
        RECOGNIZED_KEYS.contains(&name)
    }
}

/// Test simulator that records every call.
#[derive(Default)]
pub struct RecordingSimulator {
    calls: std::sync::Mutex<Vec<SimulatedInput>>,
    /// When set, every injection fails with this message.
    fail_with: Option<String>,
}

/// One recorded backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedInput {
    /// `type_text` was invoked with this text.
    Text(String),
    /// `press_named` was invoked with this backend key name.
    Press(String),
}

impl RecordingSimulator {
    /// A recorder whose injections all fail, for error-path tests.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: std::sync::Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    /// Everything injected so far, in order.
    pub fn calls(&self) -> Vec<SimulatedInput> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl KeySimulator for RecordingSimulator {
    fn type_text(&self, text: &str) -> Result<(), SimulatorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SimulatedInput::Text(text.to_string()));
        }
        match &self.fail_with {
            Some(message) => Err(SimulatorError::Injection(message.clone())),
            None => Ok(()),
        }
    }

    fn press_named(&self, name: &str) -> Result<(), SimulatorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SimulatedInput::Press(name.to_string()));
        }
        match &self.fail_with {
            Some(message) => Err(SimulatorError::Injection(message.clone())),
            None => Ok(()),
        }
    }

    fn recognizes(&self, name: &str) -> bool {
        RECOGNIZED_KEYS.contains(&name)
    }
}
