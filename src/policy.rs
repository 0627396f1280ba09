//! Client-side policy gate: decides whether a raw input event may be
//! sent at all.
//!
//! Two independently toggleable checks run before the sequencer ever
//! sees an event: sanitization (drop modifier-only and garbage keys)
//! and a denylist of modifier-chord shortcuts. A rejected event never
//! consumes a `clientEventId`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Modifier keys held at the moment of a raw keystroke.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    /// Control held.
    pub ctrl: bool,
    /// Alt/Option held.
    pub alt: bool,
    /// Shift held.
    pub shift: bool,
    /// Meta/Command/Windows held.
    pub meta: bool,
}

impl Modifiers {
    /// Any non-shift chord modifier held.
    pub fn chorded(&self) -> bool {
        self.ctrl || self.alt || self.meta
    }

    /// Any modifier at all held.
    pub fn any(&self) -> bool {
        self.ctrl || self.alt || self.shift || self.meta
    }
}

/// Raw key names that are modifiers by themselves and never produce a
/// keystroke worth relaying.
const MODIFIER_ONLY_KEYS: &[&str] = &[
    "Shift",
    "Control",
    "Alt",
    "AltGraph",
    "Meta",
    "CapsLock",
    "NumLock",
    "ScrollLock",
    "Fn",
    "FnLock",
    "Super",
    "Hyper",
    "Symbol",
];

/// Named command keys that survive sanitization even under a held
/// chord modifier. Also the recognized main-key space for shortcut
/// tokens.
const COMMAND_KEYS: &[&str] = &[
    "Backspace",
    "Delete",
    "Enter",
    "Tab",
    "Escape",
    "ArrowUp",
    "ArrowDown",
    "ArrowLeft",
    "ArrowRight",
    "Home",
    "End",
    "PageUp",
    "PageDown",
];

/// Canonical modifier name for an alias, or `None` if the alias is
/// unknown.
fn canonical_modifier(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ctrl" | "control" => Some("Control"),
        "alt" | "opt" | "option" => Some("Alt"),
        "shift" => Some("Shift"),
        "meta" | "cmd" | "command" | "super" | "win" => Some("Meta"),
        _ => None,
    }
}

/// Canonical command-key name for a case-insensitive match, or `None`.
fn canonical_command_key(raw: &str) -> Option<&'static str> {
    COMMAND_KEYS
        .iter()
        .find(|k| k.eq_ignore_ascii_case(raw))
        .copied()
}

/// Normalized modifier-chord token used for denylist matching.
///
/// Form: `Modifier+...+Main` with modifiers canonicalized into
/// {Control, Alt, Shift, Meta} and sorted lexicographically; the main
/// key is an upper-cased single character or a named command key. A
/// token with no modifier or an unrecognized main key is invalid.
pub struct ShortcutToken;

impl ShortcutToken {
    /// Normalize a configured entry like `"ctrl+alt+Delete"`. Returns
    /// `None` for invalid tokens.
    pub fn normalize(raw: &str) -> Option<String> {
        let mut parts: Vec<&str> = raw.split('+').collect();
        let main_raw = parts.pop()?.trim();
        if parts.is_empty() {
            return None;
        }

        let mut modifiers: Vec<&'static str> = Vec::new();
        for part in parts {
            let canonical = canonical_modifier(part)?;
            if !modifiers.contains(&canonical) {
                modifiers.push(canonical);
            }
        }

        let main = Self::normalize_main(main_raw)?;
        modifiers.sort_unstable();
        let mut out = modifiers.join("+");
        out.push('+');
        out.push_str(&main);
        Some(out)
    }

    /// Normalize the token for a live keystroke, from the raw key name
    /// and held modifiers. `None` when no chord modifier is held.
    pub fn from_event(raw_key: &str, mods: Modifiers) -> Option<String> {
        if !mods.any() {
            return None;
        }
        let mut modifiers: Vec<&'static str> = Vec::new();
        if mods.ctrl {
            modifiers.push("Control");
        }
        if mods.alt {
            modifiers.push("Alt");
        }
        if mods.shift {
            modifiers.push("Shift");
        }
        if mods.meta {
            modifiers.push("Meta");
        }
        let main = Self::normalize_main(raw_key)?;
        modifiers.sort_unstable();
        let mut out = modifiers.join("+");
        out.push('+');
        out.push_str(&main);
        Some(out)
    }

    fn normalize_main(raw: &str) -> Option<String> {
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c.to_uppercase().collect()),
            _ => canonical_command_key(raw).map(str::to_string),
        }
    }
}

/// Set of normalized shortcut tokens that must never be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Denylist {
    tokens: HashSet<String>,
}

impl Denylist {
    /// Build from a comma-separated configuration string. Empty and
    /// invalid entries are dropped, not inserted.
    pub fn from_csv(csv: &str) -> Self {
        let tokens = csv
            .split(',')
            .filter_map(ShortcutToken::normalize)
            .collect();
        Self { tokens }
    }

    /// Whether a normalized token is denied.
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    /// Number of valid tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the denylist holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Outcome of admitting a raw keystroke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Event may be sent with this logical key.
    Allowed(String),
    /// Dropped by sanitization; not an error, not a delivery attempt.
    Rejected,
    /// Matched the denylist; surfaced distinctly to the operator.
    BlockedShortcut(String),
}

/// The pre-send policy gate.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    /// Sanitization toggle; defaults to enabled.
    pub sanitize_enabled: bool,
    /// Denylist toggle; defaults to enabled.
    pub denylist_enabled: bool,
    denylist: Denylist,
    denylist_csv: String,
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self {
            sanitize_enabled: true,
            denylist_enabled: true,
            denylist: Denylist::default(),
            denylist_csv: String::new(),
        }
    }
}

impl PolicyGate {
    /// Gate with a denylist built from a CSV configuration string.
    pub fn with_denylist_csv(csv: &str) -> Self {
        let mut gate = Self::default();
        gate.set_denylist_csv(csv);
        gate
    }

    /// Rebuild the denylist if the configuration string changed.
    pub fn set_denylist_csv(&mut self, csv: &str) {
        if csv != self.denylist_csv {
            self.denylist = Denylist::from_csv(csv);
            self.denylist_csv = csv.to_string();
        }
    }

    /// Current denylist.
    pub fn denylist(&self) -> &Denylist {
        &self.denylist
    }

    /// Decide whether a raw keystroke may leave the sender.
    pub fn admit(&self, raw_key: &str, mods: Modifiers) -> Admission {
        if self.sanitize_enabled && !Self::sanitize_ok(raw_key, mods) {
            return Admission::Rejected;
        }
        if self.denylist_enabled {
            if let Some(token) = ShortcutToken::from_event(raw_key, mods) {
                if self.denylist.contains(&token) {
                    return Admission::BlockedShortcut(token);
                }
            }
        }
        Admission::Allowed(raw_key.to_string())
    }

    /// Sanitization: drop modifier-only keys, and chorded keystrokes
    /// unless the key is a single printable character or a named
    /// command key.
    fn sanitize_ok(raw_key: &str, mods: Modifiers) -> bool {
        if MODIFIER_ONLY_KEYS.contains(&raw_key) {
            return false;
        }
        if mods.chorded() {
            return Self::is_single_printable(raw_key) || COMMAND_KEYS.contains(&raw_key);
        }
        true
    }

    fn is_single_printable(raw_key: &str) -> bool {
        let mut chars = raw_key.chars();
        matches!((chars.next(), chars.next()), (Some(c), None) if !c.is_control())
    }
}
