use crate::input::keystrokes::KeystrokeSender;
use anyhow::{Context, Result};
use arboard::{Clipboard, ImageData};
use std::borrow::Cow;
use std::env;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use wl_clipboard_rs::copy::{ClipboardType, Error as WlCopyError, MimeType, Options, Source};

/// Clipboard content captured before the bridge overwrites it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClipboardSnapshot {
    #[default]
    Empty,
    Text(String),
    Image {
        width: usize,
        height: usize,
        bytes: Vec<u8>,
    },
}

impl ClipboardSnapshot {
    pub fn format(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text(_) => "text",
            Self::Image { .. } => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardPhase {
    Capture,
    Inject,
}

impl fmt::Display for ClipboardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Inject => f.write_str("inject"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable during {phase}: {detail}")]
    Access { phase: ClipboardPhase, detail: String },
    #[error("synthetic keystroke failed during {phase}: {detail}")]
    Keystroke { phase: ClipboardPhase, detail: String },
    #[error("could not restore the clipboard after {phase}: {detail}")]
    Restore { phase: ClipboardPhase, detail: String },
    #[error("clipboard worker stopped during {phase}: {detail}")]
    Worker { phase: ClipboardPhase, detail: String },
}

impl ClipboardError {
    pub fn phase(&self) -> ClipboardPhase {
        match self {
            Self::Access { phase, .. }
            | Self::Keystroke { phase, .. }
            | Self::Restore { phase, .. }
            | Self::Worker { phase, .. } => *phase,
        }
    }

    /// A blocking clipboard task that panicked or was cancelled.
    pub fn worker(phase: ClipboardPhase, detail: impl Into<String>) -> Self {
        Self::Worker {
            phase,
            detail: detail.into(),
        }
    }

    fn access(phase: ClipboardPhase, err: anyhow::Error) -> Self {
        Self::Access {
            phase,
            detail: format!("{err:#}"),
        }
    }

    fn keystroke(phase: ClipboardPhase, err: anyhow::Error) -> Self {
        Self::Keystroke {
            phase,
            detail: format!("{err:#}"),
        }
    }

    fn restore(phase: ClipboardPhase, err: anyhow::Error) -> Self {
        Self::Restore {
            phase,
            detail: format!("{err:#}"),
        }
    }
}

/// Raw access to the OS clipboard.
pub trait ClipboardBackend: Send {
    fn snapshot(&mut self) -> Result<ClipboardSnapshot>;
    fn restore(&mut self, snapshot: &ClipboardSnapshot) -> Result<()>;
    fn read_text(&mut self) -> Result<Option<String>>;
    fn write_text(&mut self, text: &str) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTiming {
    /// Upper bound on waiting for the clipboard after a synthetic command.
    pub settle: Duration,
    /// Clipboard polling step while waiting for a copy to land.
    pub poll_interval: Duration,
    /// Pause between writing the clipboard and sending paste.
    pub paste_delay: Duration,
}

impl Default for SettleTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            paste_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
pub struct CaptureReport {
    /// `None` when nothing (or only whitespace) was selected.
    pub text: Option<String>,
    pub restore_error: Option<ClipboardError>,
}

/// Capture/inject primitives built from save, overwrite, restore sequences.
///
/// Not reentrant: a capture and an inject must never overlap, otherwise the
/// second snapshot would record the first call's scratch content.
pub struct ClipboardBridge {
    backend: Box<dyn ClipboardBackend>,
    keys: Box<dyn KeystrokeSender>,
    timing: SettleTiming,
}

impl ClipboardBridge {
    pub fn new(
        backend: Box<dyn ClipboardBackend>,
        keys: Box<dyn KeystrokeSender>,
        timing: SettleTiming,
    ) -> Self {
        Self {
            backend,
            keys,
            timing,
        }
    }

    pub fn set_timing(&mut self, timing: SettleTiming) {
        self.timing = timing;
    }

    pub fn capture_selection(&mut self) -> Result<CaptureReport, ClipboardError> {
        let phase = ClipboardPhase::Capture;
        let saved = self
            .backend
            .snapshot()
            .map_err(|err| ClipboardError::access(phase, err))?;
        debug!(format = saved.format(), "Saved clipboard before capture");

        // An empty clipboard after the copy then means "nothing selected".
        let copied = match self.backend.clear() {
            Ok(()) => self
                .keys
                .send_copy()
                .map_err(|err| ClipboardError::keystroke(phase, err))
                .map(|()| self.wait_for_copied_text()),
            Err(err) => Err(ClipboardError::access(phase, err)),
        };

        let restore_error = self
            .backend
            .restore(&saved)
            .map_err(|err| ClipboardError::restore(phase, err))
            .err();
        if let Some(err) = &restore_error {
            warn!("{}", err);
        }

        let text = copied?;
        match &text {
            Some(text) => info!("📋 Captured selection: {} characters", text.len()),
            None => debug!("Copy produced no text; treating as empty selection"),
        }

        Ok(CaptureReport {
            text,
            restore_error,
        })
    }

    pub fn inject_replacement(&mut self, text: &str) -> Result<(), ClipboardError> {
        let phase = ClipboardPhase::Inject;
        let saved = self
            .backend
            .snapshot()
            .map_err(|err| ClipboardError::access(phase, err))?;
        debug!(format = saved.format(), "Saved clipboard before inject");

        let pasted = self
            .backend
            .write_text(text)
            .map_err(|err| ClipboardError::access(phase, err))
            .and_then(|()| {
                thread::sleep(self.timing.paste_delay);
                self.keys
                    .send_paste()
                    .map_err(|err| ClipboardError::keystroke(phase, err))
            });

        if pasted.is_ok() {
            // The target application reads the clipboard asynchronously.
            thread::sleep(self.timing.settle);
        }

        let restored = self
            .backend
            .restore(&saved)
            .map_err(|err| ClipboardError::restore(phase, err));

        match (pasted, restored) {
            (Ok(()), Ok(())) => {
                info!("✅ Replacement pasted ({} characters)", text.len());
                Ok(())
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(restore_err)) => Err(restore_err),
            (Err(err), Err(restore_err)) => {
                warn!("{}", restore_err);
                Err(err)
            }
        }
    }

    fn wait_for_copied_text(&mut self) -> Option<String> {
        let deadline = Instant::now() + self.timing.settle;
        loop {
            match self.backend.read_text() {
                Ok(Some(text)) if !text.trim().is_empty() => return Some(text),
                Ok(_) => {}
                Err(err) => debug!("Clipboard read while settling failed: {err:#}"),
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(self.timing.poll_interval);
        }
    }
}

/// `arboard` clipboard, mirrored to `wl-clipboard-rs` for writes on Wayland.
pub struct SystemClipboard {
    clipboard: Clipboard,
    wayland_clipboard_enabled: bool,
}

impl SystemClipboard {
    pub fn new() -> Result<Self> {
        let clipboard = Clipboard::new().context("Failed to initialize clipboard")?;
        let wayland_clipboard_enabled = env::var("WAYLAND_DISPLAY").is_ok();
        if wayland_clipboard_enabled {
            debug!("Wayland session detected; mirroring clipboard writes via wl-clipboard-rs");
        }
        Ok(Self {
            clipboard,
            wayland_clipboard_enabled,
        })
    }

    fn copy_wayland_clipboard(&self, text: &str) -> Result<(), WlCopyError> {
        let mut options = Options::new();
        options.clipboard(ClipboardType::Regular);
        options.copy(
            Source::Bytes(text.as_bytes().to_vec().into_boxed_slice()),
            MimeType::Text,
        )
    }
}

impl ClipboardBackend for SystemClipboard {
    fn snapshot(&mut self) -> Result<ClipboardSnapshot> {
        if let Ok(text) = self.clipboard.get_text() {
            return Ok(ClipboardSnapshot::Text(text));
        }
        match self.clipboard.get_image() {
            Ok(image) => Ok(ClipboardSnapshot::Image {
                width: image.width,
                height: image.height,
                bytes: image.bytes.into_owned(),
            }),
            Err(arboard::Error::ContentNotAvailable) => Ok(ClipboardSnapshot::Empty),
            Err(err) => Err(err).context("Failed to read clipboard contents"),
        }
    }

    fn restore(&mut self, snapshot: &ClipboardSnapshot) -> Result<()> {
        match snapshot {
            ClipboardSnapshot::Empty => self.clear(),
            ClipboardSnapshot::Text(text) => self.write_text(text),
            ClipboardSnapshot::Image {
                width,
                height,
                bytes,
            } => self
                .clipboard
                .set_image(ImageData {
                    width: *width,
                    height: *height,
                    bytes: Cow::Borrowed(bytes.as_slice()),
                })
                .context("Failed to restore clipboard image"),
        }
    }

    fn read_text(&mut self) -> Result<Option<String>> {
        match self.clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(err) => Err(err).context("Failed to read clipboard text"),
        }
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        if self.wayland_clipboard_enabled {
            if let Err(err) = self.copy_wayland_clipboard(text) {
                warn!("Wayland clipboard copy failed (falling back to arboard): {err:?}");
                self.wayland_clipboard_enabled = false;
            }
        }
        self.clipboard
            .set_text(text)
            .context("Failed to write clipboard text")
    }

    fn clear(&mut self) -> Result<()> {
        self.clipboard.clear().context("Failed to clear clipboard")
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct FakeDesktop {
        pub clipboard: ClipboardSnapshot,
        /// What the focused application would put on the clipboard for Ctrl+C.
        pub selection: Option<String>,
        pub pasted: Vec<String>,
        pub copies: usize,
        pub fail_restore: bool,
        pub fail_paste: bool,
    }

    pub type SharedDesktop = Arc<Mutex<FakeDesktop>>;

    pub struct FakeClipboard(pub SharedDesktop);
    pub struct FakeKeys(pub SharedDesktop);

    impl ClipboardBackend for FakeClipboard {
        fn snapshot(&mut self) -> Result<ClipboardSnapshot> {
            Ok(self.0.lock().unwrap().clipboard.clone())
        }

        fn restore(&mut self, snapshot: &ClipboardSnapshot) -> Result<()> {
            let mut desktop = self.0.lock().unwrap();
            if desktop.fail_restore {
                anyhow::bail!("clipboard owner went away");
            }
            desktop.clipboard = snapshot.clone();
            Ok(())
        }

        fn read_text(&mut self) -> Result<Option<String>> {
            Ok(match &self.0.lock().unwrap().clipboard {
                ClipboardSnapshot::Text(text) => Some(text.clone()),
                _ => None,
            })
        }

        fn write_text(&mut self, text: &str) -> Result<()> {
            self.0.lock().unwrap().clipboard = ClipboardSnapshot::Text(text.to_string());
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.0.lock().unwrap().clipboard = ClipboardSnapshot::Empty;
            Ok(())
        }
    }

    impl KeystrokeSender for FakeKeys {
        fn send_copy(&mut self) -> Result<()> {
            let mut desktop = self.0.lock().unwrap();
            desktop.copies += 1;
            if let Some(selection) = desktop.selection.clone() {
                desktop.clipboard = ClipboardSnapshot::Text(selection);
            }
            Ok(())
        }

        fn send_paste(&mut self) -> Result<()> {
            let mut desktop = self.0.lock().unwrap();
            if desktop.fail_paste {
                anyhow::bail!("virtual keyboard unavailable");
            }
            if let ClipboardSnapshot::Text(text) = desktop.clipboard.clone() {
                desktop.pasted.push(text);
            }
            Ok(())
        }
    }

    pub fn instant_timing() -> SettleTiming {
        SettleTiming {
            settle: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            paste_delay: Duration::ZERO,
        }
    }

    pub fn bridge(desktop: &SharedDesktop) -> ClipboardBridge {
        ClipboardBridge::new(
            Box::new(FakeClipboard(Arc::clone(desktop))),
            Box::new(FakeKeys(Arc::clone(desktop))),
            instant_timing(),
        )
    }

    pub fn desktop(clipboard: &str, selection: Option<&str>) -> SharedDesktop {
        Arc::new(Mutex::new(FakeDesktop {
            clipboard: ClipboardSnapshot::Text(clipboard.to_string()),
            selection: selection.map(str::to_string),
            ..FakeDesktop::default()
        }))
    }
}
