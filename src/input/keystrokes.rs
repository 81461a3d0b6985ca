use anyhow::{anyhow, Context, Result};
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use serde_json::Value;
use std::collections::HashSet;
use std::env;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use wrtype::{Modifier, WrtypeClient};

/// Synthetic copy/paste commands sent to the focused application.
pub trait KeystrokeSender: Send {
    fn send_copy(&mut self) -> Result<()>;
    fn send_paste(&mut self) -> Result<()>;
}

const TERMINAL_CLASSES: &[&str] = &[
    "Alacritty",
    "kitty",
    "foot",
    "footclient",
    "org.wezfurlong.wezterm",
    "org.gnome.Console",
    "gnome-terminal-server",
    "konsole",
    "yakuake",
    "terminator",
    "tilix",
    "xfce4-terminal",
    "WarpTerminal",
    "xterm",
    "urxvt",
    "com.mitchellh.ghostty",
];

const TERMINAL_CLASS_COMPONENTS: &[&str] = &[
    "terminal",
    "console",
    "ghostty",
    "wezterm",
    "kitty",
    "alacritty",
    "foot",
    "konsole",
    "xterm",
    "urxvt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChordModifier {
    Ctrl,
    Shift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChordKey {
    Letter(char),
    Insert,
}

/// A modifier combination plus one key, e.g. Ctrl+Shift+C.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Chord {
    modifiers: Vec<ChordModifier>,
    key: ChordKey,
}

impl Chord {
    fn copy(terminal: bool, insert_keys: bool) -> Self {
        if insert_keys {
            return Self {
                modifiers: vec![ChordModifier::Ctrl],
                key: ChordKey::Insert,
            };
        }
        Self::ctrl_letter('c', terminal)
    }

    fn paste(terminal: bool, insert_keys: bool) -> Self {
        if insert_keys {
            return Self {
                modifiers: vec![ChordModifier::Shift],
                key: ChordKey::Insert,
            };
        }
        Self::ctrl_letter('v', terminal)
    }

    fn ctrl_letter(letter: char, terminal: bool) -> Self {
        let mut modifiers = vec![ChordModifier::Ctrl];
        if terminal {
            modifiers.push(ChordModifier::Shift);
        }
        Self {
            modifiers,
            key: ChordKey::Letter(letter),
        }
    }

    fn hyprland_command(&self) -> String {
        let mods: Vec<&str> = self
            .modifiers
            .iter()
            .map(|modifier| match modifier {
                ChordModifier::Ctrl => "CTRL",
                ChordModifier::Shift => "SHIFT",
            })
            .collect();
        let key = match self.key {
            ChordKey::Letter(letter) => letter.to_string(),
            ChordKey::Insert => "Insert".to_string(),
        };
        format!("dispatch sendshortcut {}, {}, active", mods.join(" "), key)
    }

    fn wrtype_parts(&self) -> (Vec<Modifier>, String) {
        let mods = self
            .modifiers
            .iter()
            .map(|modifier| match modifier {
                ChordModifier::Ctrl => Modifier::Ctrl,
                ChordModifier::Shift => Modifier::Shift,
            })
            .collect();
        let key = match self.key {
            ChordKey::Letter(letter) => letter.to_string(),
            ChordKey::Insert => "Insert".to_string(),
        };
        (mods, key)
    }

    fn send_with_enigo(&self) -> Result<()> {
        let mut enigo = Enigo::new(&Settings::default())
            .context("Failed to initialize Enigo for synthetic input")?;
        let keys: Vec<Key> = self
            .modifiers
            .iter()
            .map(|modifier| match modifier {
                ChordModifier::Ctrl => Key::Control,
                ChordModifier::Shift => Key::Shift,
            })
            .collect();

        for key in &keys {
            enigo
                .key(*key, Direction::Press)
                .with_context(|| format!("Failed to press {key:?}"))?;
        }
        let main_key = match self.key {
            ChordKey::Letter(letter) => Key::Unicode(letter),
            ChordKey::Insert => Key::Insert,
        };
        let clicked = enigo
            .key(main_key, Direction::Click)
            .with_context(|| format!("Failed to press {main_key:?}"));
        for key in keys.iter().rev() {
            enigo
                .key(*key, Direction::Release)
                .with_context(|| format!("Failed to release {key:?}"))?;
        }
        clicked
    }
}

/// Minimal synchronous client for the Hyprland control socket.
struct HyprlandDispatcher {
    socket_path: PathBuf,
}

impl HyprlandDispatcher {
    fn new() -> Option<Self> {
        let runtime_dir = env::var("XDG_RUNTIME_DIR").ok()?;
        let signature = env::var("HYPRLAND_INSTANCE_SIGNATURE").ok()?;
        let socket_path = PathBuf::from(runtime_dir)
            .join("hypr")
            .join(signature)
            .join(".socket.sock");

        socket_path.exists().then_some(Self { socket_path })
    }

    fn send_chord(&self, chord: &Chord) -> Result<()> {
        let response = self.send_command(&chord.hyprland_command())?;
        if response.is_empty() || response.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(anyhow!("Hyprland sendshortcut error: {response}"))
        }
    }

    fn active_window_class(&self) -> Result<Option<String>> {
        let json_response = self.send_command("j/activewindow")?;
        if let Some(class) = extract_window_class(&json_response) {
            return Ok(Some(class));
        }
        let plain_response = self.send_command("activewindow")?;
        Ok(extract_window_class(&plain_response))
    }

    fn send_command(&self, command: &str) -> Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "Failed to connect to Hyprland socket at {}",
                self.socket_path.display()
            )
        })?;
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to configure Hyprland socket timeout")?;
        stream
            .write_all(command.as_bytes())
            .with_context(|| format!("Failed to send IPC command: {command}"))?;
        stream
            .shutdown(Shutdown::Write)
            .context("Failed to finish Hyprland IPC write")?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .context("Failed to read Hyprland IPC response")?;
        let text = String::from_utf8_lossy(&response).trim().to_string();
        debug!(command, response = text.as_str(), "Hyprland IPC response");
        Ok(text)
    }
}

fn extract_window_class(response: &str) -> Option<String> {
    let trimmed = response.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown request") {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value
            .get("class")
            .and_then(Value::as_str)
            .filter(|class| !class.is_empty())
            .map(str::to_string);
    }

    trimmed.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        let value = value.trim();
        (key.trim().eq_ignore_ascii_case("class") && !value.is_empty())
            .then(|| value.to_string())
    })
}

fn is_terminal_class(class: &str, extra_terminal_classes: &HashSet<String>) -> bool {
    if TERMINAL_CLASSES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(class))
    {
        return true;
    }

    let lower = class.to_ascii_lowercase();
    if extra_terminal_classes.contains(&lower) {
        return true;
    }

    lower.split(['.', '-', '_']).any(|component| {
        TERMINAL_CLASS_COMPONENTS.contains(&component) || extra_terminal_classes.contains(component)
    })
}

/// Sends copy/paste through Hyprland IPC, then a Wayland virtual keyboard,
/// then Enigo, stopping at the first backend that accepts the chord.
pub struct SystemKeystrokes {
    default_terminal: bool,
    insert_keys: bool,
    extra_terminal_classes: HashSet<String>,
    hyprland_dispatcher: Option<HyprlandDispatcher>,
    wrtype_client: Option<WrtypeClient>,
    wrtype_attempted: bool,
    wayland_env: bool,
}

impl SystemKeystrokes {
    pub fn new(
        default_terminal: bool,
        insert_keys: bool,
        extra_terminal_classes: Vec<String>,
    ) -> Self {
        let wayland_env = env::var("WAYLAND_DISPLAY").is_ok();
        let hyprland_dispatcher = HyprlandDispatcher::new();

        if hyprland_dispatcher.is_some() {
            debug!("Hyprland IPC detected; using sendshortcut for copy/paste");
        } else if wayland_env {
            debug!("Wayland session without Hyprland IPC; virtual keyboard will be used");
        }

        Self {
            default_terminal,
            insert_keys,
            extra_terminal_classes: extra_terminal_classes
                .into_iter()
                .map(|entry| entry.trim().to_ascii_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect(),
            hyprland_dispatcher,
            wrtype_client: None,
            wrtype_attempted: false,
            wayland_env,
        }
    }

    fn focused_is_terminal(&self) -> bool {
        let Some(dispatcher) = self.hyprland_dispatcher.as_ref() else {
            return self.default_terminal;
        };
        match dispatcher.active_window_class() {
            Ok(Some(class)) => {
                let terminal = is_terminal_class(&class, &self.extra_terminal_classes);
                debug!(class = class.as_str(), terminal, "Active window classification");
                terminal || self.default_terminal
            }
            Ok(None) => self.default_terminal,
            Err(err) => {
                warn!("Failed to query Hyprland active window class: {err:?}");
                self.default_terminal
            }
        }
    }

    fn ensure_wrtype_client(&mut self) -> Option<&mut WrtypeClient> {
        if !self.wayland_env {
            return None;
        }

        if self.wrtype_client.is_none() && !self.wrtype_attempted {
            self.wrtype_attempted = true;
            match WrtypeClient::new() {
                Ok(client) => {
                    debug!("Initialized Wayland virtual keyboard client");
                    self.wrtype_client = Some(client);
                }
                Err(err) => {
                    warn!("Failed to initialize Wayland virtual keyboard client: {err:?}");
                }
            }
        }

        self.wrtype_client.as_mut()
    }

    fn send(&mut self, chord: Chord, label: &str) -> Result<()> {
        if let Some(dispatcher) = self.hyprland_dispatcher.as_ref() {
            match dispatcher.send_chord(&chord) {
                Ok(()) => {
                    debug!("{} sent via Hyprland sendshortcut", label);
                    return Ok(());
                }
                Err(err) => warn!("Hyprland {} failed: {err:?}", label),
            }
        }

        let (mods, key) = chord.wrtype_parts();
        if let Some(client) = self.ensure_wrtype_client() {
            match client.send_shortcut(&mods, &key) {
                Ok(()) => {
                    debug!("{} sent via Wayland virtual keyboard", label);
                    return Ok(());
                }
                Err(err) => {
                    warn!("Wayland virtual keyboard {} failed: {err:?}", label);
                    self.wrtype_client = None;
                    self.wrtype_attempted = false;
                }
            }
        }

        chord.send_with_enigo()?;
        info!("{} sent via Enigo fallback", label);
        Ok(())
    }
}

impl KeystrokeSender for SystemKeystrokes {
    fn send_copy(&mut self) -> Result<()> {
        let chord = Chord::copy(self.focused_is_terminal(), self.insert_keys);
        self.send(chord, "copy")
    }

    fn send_paste(&mut self) -> Result<()> {
        let chord = Chord::paste(self.focused_is_terminal(), self.insert_keys);
        self.send(chord, "paste")
    }
}
