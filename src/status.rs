use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// XDG-compliant paths for lifai runtime state
pub mod paths {
    use std::path::PathBuf;

    /// ~/.cache/lifai-rs/ - ephemeral status for Waybar and the toolbar
    pub fn cache_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|d| d.cache_dir().join("lifai-rs"))
            .unwrap_or_else(|| PathBuf::from("/tmp/lifai-rs"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaybarState {
    Idle,
    Busy,
    Error,
}

impl WaybarState {
    fn icon(&self) -> &'static str {
        match self {
            Self::Idle => "󰏫",
            Self::Busy => "󰦖",
            Self::Error => "󰅙",
        }
    }

    fn class(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WaybarStatus {
    text: String,
    tooltip: String,
    class: String,
    alt: String,
}

/// Where the floating toolbar should be drawn, for whatever renders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolbarStatus {
    pub visible: bool,
    pub enabled: bool,
    pub x: i32,
    pub y: i32,
}

impl Default for ToolbarStatus {
    fn default() -> Self {
        Self {
            visible: false,
            enabled: true,
            x: 0,
            y: 0,
        }
    }
}

/// Writes daemon state for Waybar and the toolbar to read (JSON format)
pub struct StatusWriter {
    status_file: PathBuf,
    toolbar_file: PathBuf,
}

impl StatusWriter {
    pub fn new() -> Result<Self> {
        Self::in_dir(&paths::cache_dir())
    }

    pub fn in_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).context("Failed to create cache directory")?;
        Ok(Self {
            status_file: dir.join("status.json"),
            toolbar_file: dir.join("toolbar.json"),
        })
    }

    /// Update Waybar status with state and tooltip
    pub fn set_state(&self, state: WaybarState, tooltip: &str) -> Result<()> {
        let status = WaybarStatus {
            text: state.icon().to_string(),
            tooltip: tooltip.to_string(),
            class: state.class().to_string(),
            alt: state.class().to_string(),
        };

        let json = serde_json::to_string(&status).context("Failed to serialize status")?;
        fs::write(&self.status_file, &json).context("Failed to write status file")?;

        tracing::debug!(state = ?state, tooltip = %tooltip, "Updated Waybar status");

        self.signal_waybar();
        Ok(())
    }

    pub fn set_error(&self, message: &str) -> Result<()> {
        self.set_state(WaybarState::Error, &format!("Error: {}", message))
    }

    pub fn set_toolbar(&self, toolbar: ToolbarStatus) -> Result<()> {
        let json = serde_json::to_string(&toolbar).context("Failed to serialize toolbar")?;
        fs::write(&self.toolbar_file, json).context("Failed to write toolbar file")?;
        tracing::debug!(?toolbar, "Updated toolbar status");
        Ok(())
    }

    pub fn state(&self) -> Option<WaybarState> {
        let content = fs::read_to_string(&self.status_file).ok()?;
        let status: WaybarStatus = serde_json::from_str(&content).ok()?;
        serde_json::from_value(serde_json::Value::String(status.class)).ok()
    }

    /// Signal Waybar to refresh the custom module
    fn signal_waybar(&self) {
        // SIGRTMIN+9 for custom module refresh
        let result = Command::new("/usr/bin/pkill")
            .args(["-RTMIN+9", "waybar"])
            .status();

        if let Err(e) = result {
            tracing::debug!("Failed to signal waybar: {}", e);
        }
    }

    /// Clean up status files on shutdown
    pub fn cleanup(&self) -> Result<()> {
        if self.toolbar_file.exists() {
            fs::remove_file(&self.toolbar_file).context("Failed to remove toolbar file")?;
        }
        if self.status_file.exists() {
            fs::remove_file(&self.status_file).context("Failed to remove status file")?;
            self.signal_waybar();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reads_back_state() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::in_dir(dir.path()).unwrap();

        writer.set_state(WaybarState::Busy, "Summarize").unwrap();
        assert_eq!(writer.state(), Some(WaybarState::Busy));

        let raw = fs::read_to_string(dir.path().join("status.json")).unwrap();
        assert!(raw.contains("\"tooltip\":\"Summarize\""));
    }

    #[test]
    fn cleanup_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::in_dir(dir.path()).unwrap();
        writer.set_error("boom").unwrap();
        writer.set_toolbar(ToolbarStatus::default()).unwrap();

        writer.cleanup().unwrap();
        assert!(writer.state().is_none());
        assert!(!dir.path().join("toolbar.json").exists());
    }
}
