pub mod clipboard;
pub mod devices;
pub mod keystrokes;
pub mod shortcuts;
pub mod watcher;

pub use clipboard::{
    CaptureReport, ClipboardBackend, ClipboardBridge, ClipboardError, ClipboardPhase,
    ClipboardSnapshot, SettleTiming, SystemClipboard,
};
pub use keystrokes::{KeystrokeSender, SystemKeystrokes};
pub use shortcuts::{GlobalShortcut, ShortcutEvent};
pub use watcher::{
    ArmPolicy, InputWatcher, SelectionArming, SelectionEvent, WatcherControl, WatcherEvent,
};
