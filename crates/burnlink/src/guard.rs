//! Exfiltration deterrents for an open secret.
//!
//! These checks raise the cost of casually copying a displayed secret. They
//! are not a security boundary: anyone controlling the viewing machine can
//! get around all of them.

/// Default gap between outer and inner window size that suggests docked inspection tooling.
pub const INSPECTION_THRESHOLD_PX: u32 = 160;

/// A key press, with modifier state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChord {
    /// Key name as reported by the UI layer, e.g. `"c"`, `"F12"`, `"PrintScreen"`.
    pub key: String,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
}

impl KeyChord {
    pub fn plain(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            meta: false,
            shift: false,
        }
    }

    pub fn ctrl(key: impl Into<String>) -> Self {
        Self {
            ctrl: true,
            ..Self::plain(key)
        }
    }

    pub fn meta(key: impl Into<String>) -> Self {
        Self {
            meta: true,
            ..Self::plain(key)
        }
    }

    pub fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }
}

/// User interface events the viewer forwards while a secret is displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    ContextMenu,
    SelectStart,
    Copy,
    Cut,
    Paste,
    DragStart,
    Key(KeyChord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the event through.
    Allow,
    /// Swallow the event.
    Suppress,
    /// Destroy the secret immediately.
    Destroy,
}

pub fn evaluate(event: &UiEvent) -> Verdict {
    match event {
        UiEvent::ContextMenu
        | UiEvent::SelectStart
        | UiEvent::Copy
        | UiEvent::Cut
        | UiEvent::Paste
        | UiEvent::DragStart => Verdict::Suppress,
        UiEvent::Key(chord) => evaluate_key(chord),
    }
}

fn evaluate_key(chord: &KeyChord) -> Verdict {
    if chord.key.eq_ignore_ascii_case("PrintScreen") {
        return Verdict::Destroy;
    }
    if chord.key.eq_ignore_ascii_case("F12") {
        return Verdict::Suppress;
    }
    if !(chord.ctrl || chord.meta) {
        return Verdict::Allow;
    }

    let key = chord.key.to_ascii_lowercase();
    // Inspector, console, element picker, save.
    let inspection = chord.shift && matches!(key.as_str(), "i" | "j" | "c" | "s");
    // View source, save, select all, clipboard, print.
    let shortcut = matches!(key.as_str(), "u" | "s" | "a" | "c" | "v" | "x" | "p");

    if inspection || shortcut {
        Verdict::Suppress
    } else {
        Verdict::Allow
    }
}

/// Outer (frame) and inner (viewport) window size, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowMetrics {
    pub outer_width: u32,
    pub outer_height: u32,
    pub inner_width: u32,
    pub inner_height: u32,
}

/// Source of window metrics, supplied by the UI layer.
pub trait WindowProbe: Send + Sync {
    fn metrics(&self) -> WindowMetrics;
}

/// True when either dimension of the frame exceeds the viewport by more than `threshold`.
pub fn inspection_suspected(metrics: WindowMetrics, threshold: u32) -> bool {
    metrics.outer_width.saturating_sub(metrics.inner_width) > threshold
        || metrics.outer_height.saturating_sub(metrics.inner_height) > threshold
}
