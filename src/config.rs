use anyhow::{Context, Result};
use jsonc_parser::ParseOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerSettings, TriggerStyle};
use crate::input::clipboard::SettleTiming;
use crate::paths::expand_tilde;
use crate::prompts::DEFAULT_PROMPT;
use crate::ui::ToolbarGeometry;

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ollama: OllamaConfig,
    pub trigger: TriggerConfig,
    pub clipboard: ClipboardConfig,
    pub toolbar: ToolbarConfig,
    /// Extra or replacement templates, keyed by action name.
    pub prompts: BTreeMap<String, String>,
    pub notifications: bool,
    pub log_timings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            trigger: TriggerConfig::default(),
            clipboard: ClipboardConfig::default(),
            toolbar: ToolbarConfig::default(),
            prompts: BTreeMap::new(),
            notifications: true,
            log_timings: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama2".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Immediate,
    Armed,
}

impl From<TriggerMode> for TriggerStyle {
    fn from(mode: TriggerMode) -> Self {
        match mode {
            TriggerMode::Immediate => TriggerStyle::Immediate,
            TriggerMode::Armed => TriggerStyle::Armed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub style: TriggerMode,
    /// Keyboard chord such as `"SUPER+ALT+E"`; `null` disables it.
    pub shortcut: Option<String>,
    pub default_prompt: String,
    pub hold_threshold_ms: u64,
    pub selection_delay_ms: u64,
    /// Show the toolbar after every drag-select, not only when armed.
    pub follow_selection: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            style: TriggerMode::Immediate,
            shortcut: Some("SUPER+ALT+E".to_string()),
            default_prompt: DEFAULT_PROMPT.to_string(),
            hold_threshold_ms: 200,
            selection_delay_ms: 200,
            follow_selection: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PasteHintsConfig {
    /// Extra window classes that need Ctrl+Shift chords.
    pub shift: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipboardConfig {
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    pub paste_delay_ms: u64,
    pub shift_paste: bool,
    /// Use Ctrl+Insert / Shift+Insert instead of C/V chords.
    pub global_shortcuts: bool,
    pub paste_hints: PasteHintsConfig,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            settle_ms: 100,
            poll_interval_ms: 10,
            paste_delay_ms: 50,
            shift_paste: false,
            global_shortcuts: false,
            paste_hints: PasteHintsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolbarConfig {
    pub width: i32,
    pub height: i32,
    pub offset_x: i32,
    pub offset_y: i32,
    /// Overrides the detected screen size, as `[width, height]`.
    pub screen: Option<(i32, i32)>,
}

impl Default for ToolbarConfig {
    fn default() -> Self {
        let geometry = ToolbarGeometry::default();
        Self {
            width: geometry.width,
            height: geometry.height,
            offset_x: geometry.offset_x,
            offset_y: geometry.offset_y,
            screen: None,
        }
    }
}

impl Config {
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            model: self.ollama.model.clone(),
            request_timeout: Duration::from_secs(self.ollama.request_timeout_secs.max(1)),
            selection_delay: Duration::from_millis(self.trigger.selection_delay_ms),
            clipboard: self.settle_timing(),
            log_timings: self.log_timings,
        }
    }

    pub fn settle_timing(&self) -> SettleTiming {
        SettleTiming {
            settle: Duration::from_millis(self.clipboard.settle_ms),
            poll_interval: Duration::from_millis(self.clipboard.poll_interval_ms.max(1)),
            paste_delay: Duration::from_millis(self.clipboard.paste_delay_ms),
        }
    }

    pub fn hold_threshold(&self) -> Duration {
        Duration::from_millis(self.trigger.hold_threshold_ms)
    }

    pub fn toolbar_geometry(&self) -> ToolbarGeometry {
        ToolbarGeometry {
            width: self.toolbar.width,
            height: self.toolbar.height,
            offset_x: self.toolbar.offset_x,
            offset_y: self.toolbar.offset_y,
        }
    }

    pub fn shortcut(&self) -> Option<&str> {
        self.trigger
            .shortcut
            .as_deref()
            .map(str::trim)
            .filter(|shortcut| !shortcut.is_empty())
    }
}

/// Parses a JSONC document; an empty document yields defaults.
pub fn parse_config(text: &str) -> Result<Config> {
    let value = jsonc_parser::parse_to_serde_value(text, &ParseOptions::default())
        .map_err(|err| anyhow::anyhow!("Invalid JSONC: {err}"))?;
    match value {
        Some(value) => serde_json::from_value(value).context("Invalid configuration values"),
        None => Ok(Config::default()),
    }
}

pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "lifai-rs")
        .map(|dirs| dirs.config_dir().join("config.jsonc"))
        .unwrap_or_else(|| expand_tilde("~/.config/lifai-rs/config.jsonc"))
}

/// Read-only view of the config file that follows edits on disk.
///
/// The file is never written; a missing file means defaults.
#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
    sender: Arc<watch::Sender<Config>>,
}

impl ConfigManager {
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let path = expand_tilde(&path.to_string_lossy());
        let config = read_config(&path)?;
        let (sender, _) = watch::channel(config);
        Ok(Self {
            path,
            sender: Arc::new(sender),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Config {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.sender.subscribe()
    }

    /// Re-reads the file and publishes it when it differs from the current
    /// config. Returns whether subscribers were notified.
    pub fn reload(&self) -> Result<bool> {
        let config = read_config(&self.path)?;
        Ok(self.sender.send_if_modified(|current| {
            if *current == config {
                false
            } else {
                *current = config;
                true
            }
        }))
    }

    /// Polls the file's modification time and reloads on change. The thread
    /// ends once every clone of this manager is dropped.
    pub fn start_watching(&self) {
        let path = self.path.clone();
        let sender = Arc::downgrade(&self.sender);
        let spawned = std::thread::Builder::new()
            .name("lifai-config".into())
            .spawn(move || watch_file(path, sender));
        if let Err(err) = spawned {
            error!("Failed to start config watcher: {}", err);
        }
    }
}

fn read_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!("No config at {}; using defaults", path.display());
        return Ok(Config::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn watch_file(path: PathBuf, sender: Weak<watch::Sender<Config>>) {
    let mut last_seen = modified_at(&path);
    debug!(path = %path.display(), "Watching config file");

    loop {
        std::thread::sleep(WATCH_INTERVAL);
        let Some(sender) = sender.upgrade() else {
            break;
        };

        let current = modified_at(&path);
        if current == last_seen {
            continue;
        }
        last_seen = current;

        match read_config(&path) {
            Ok(config) => {
                let changed = sender.send_if_modified(|existing| {
                    if *existing == config {
                        false
                    } else {
                        *existing = config;
                        true
                    }
                });
                if changed {
                    info!("🔄 Configuration reloaded from {}", path.display());
                }
            }
            Err(err) => warn!("Keeping previous configuration: {:#}", err),
        }
    }

    debug!("Config watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_trailing_commas_are_accepted() {
        let config = parse_config(
            r#"{
                // local model
                "ollama": { "model": "qwen2.5", },
                "trigger": { "style": "armed", "shortcut": null },
            }"#,
        )
        .unwrap();

        assert_eq!(config.ollama.model, "qwen2.5");
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert_eq!(config.trigger.style, TriggerMode::Armed);
        assert_eq!(config.shortcut(), None);
        assert_eq!(config.trigger.hold_threshold_ms, 200);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(parse_config("").unwrap(), Config::default());
        assert_eq!(parse_config("  // nothing\n").unwrap(), Config::default());
    }

    #[test]
    fn rejects_wrong_value_types() {
        assert!(parse_config(r#"{"clipboard": {"settle_ms": "slow"}}"#).is_err());
    }

    #[test]
    fn derived_settings_follow_config() {
        let config = parse_config(
            r#"{
                "ollama": { "request_timeout_secs": 5 },
                "clipboard": { "settle_ms": 250 },
                "log_timings": true
            }"#,
        )
        .unwrap();

        let settings = config.controller_settings();
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.selection_delay, Duration::from_millis(200));
        assert!(settings.log_timings);
        assert_eq!(config.settle_timing().settle, Duration::from_millis(250));
    }

    #[test]
    fn missing_file_loads_defaults_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");

        let manager = ConfigManager::load_from(&path).unwrap();
        assert_eq!(manager.get(), Config::default());
        assert!(!path.exists());
    }

    #[test]
    fn reload_publishes_only_real_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");
        fs::write(&path, r#"{"ollama": {"model": "a"}}"#).unwrap();

        let manager = ConfigManager::load_from(&path).unwrap();
        let mut rx = manager.subscribe();
        assert!(!manager.reload().unwrap());
        assert!(!rx.has_changed().unwrap());

        fs::write(&path, r#"{"ollama": {"model": "b"}}"#).unwrap();
        assert!(manager.reload().unwrap());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().ollama.model, "b");
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.jsonc");
        fs::write(&path, "{ not json").unwrap();
        assert!(ConfigManager::load_from(&path).is_err());
    }
}
