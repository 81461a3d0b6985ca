use anyhow::{anyhow, Context, Result};
use evdev::{InputEventKind, Key};
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::devices::{DeviceClass, DeviceSet};

const DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ShortcutEvent {
    pub triggered_at: Instant,
}

/// Keyboard chord listener that raises one event per press of the chord.
pub struct GlobalShortcut {
    devices: DeviceSet,
    target_keys: HashSet<Key>,
    shortcut_name: String,
}

impl GlobalShortcut {
    pub fn new(shortcut: &str, stop: Arc<AtomicBool>) -> Result<Self> {
        let target_keys = parse_shortcut(shortcut)?;
        let devices = DeviceSet::open(DeviceClass::Keyboard, stop)?;
        if devices.is_empty() {
            return Err(anyhow!("No keyboard devices found"));
        }

        info!(
            "Global shortcut initialized - monitoring {} device(s) for: {}",
            devices.len(),
            shortcut
        );
        debug!("Target keys: {:?}", target_keys);

        Ok(Self {
            devices,
            target_keys,
            shortcut_name: shortcut.to_string(),
        })
    }

    pub fn run(mut self, tx: mpsc::Sender<ShortcutEvent>, stop: Arc<AtomicBool>) -> Result<()> {
        let mut chord = ChordTracker::new(self.target_keys.clone());
        let mut events = Vec::new();

        info!("🎯 Listening for shortcut: {}", self.shortcut_name);

        while !stop.load(Ordering::Relaxed) {
            if self.devices.maintain() {
                chord.reset();
            }

            events.clear();
            if self.devices.read_events(&mut events) {
                chord.reset();
            }

            for event in &events {
                let InputEventKind::Key(key) = event.kind() else {
                    continue;
                };
                let now = Instant::now();
                if chord.on_key(key, event.value(), now) {
                    info!("✨ Shortcut triggered: {}", self.shortcut_name);
                    if let Err(err) = tx.try_send(ShortcutEvent { triggered_at: now }) {
                        warn!("Failed to send shortcut event: {}", err);
                    }
                }
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        info!("Stopping shortcut listener: {}", self.shortcut_name);
        Ok(())
    }
}

/// Tracks held keys and reports the moment the full chord goes down.
struct ChordTracker {
    target: HashSet<Key>,
    pressed: HashSet<Key>,
    active: bool,
    last_trigger: Option<Instant>,
}

impl ChordTracker {
    fn new(target: HashSet<Key>) -> Self {
        Self {
            target,
            pressed: HashSet::new(),
            active: false,
            last_trigger: None,
        }
    }

    fn reset(&mut self) {
        self.pressed.clear();
        self.active = false;
    }

    /// `value` follows evdev: 1 press, 0 release, 2 autorepeat.
    fn on_key(&mut self, key: Key, value: i32, now: Instant) -> bool {
        match value {
            1 => {
                self.pressed.insert(key);
                if self.active || !self.target.is_subset(&self.pressed) {
                    return false;
                }
                self.active = true;
                let debounced = self
                    .last_trigger
                    .is_some_and(|last| now.duration_since(last) <= DEBOUNCE);
                if debounced {
                    debug!("Shortcut debounced (too soon)");
                    return false;
                }
                self.last_trigger = Some(now);
                true
            }
            0 => {
                self.pressed.remove(&key);
                if self.active && !self.target.is_subset(&self.pressed) {
                    self.active = false;
                }
                false
            }
            _ => false,
        }
    }
}

const NAMED_KEYS: &[(&str, Key)] = &[
    ("SUPER", Key::KEY_LEFTMETA),
    ("META", Key::KEY_LEFTMETA),
    ("WIN", Key::KEY_LEFTMETA),
    ("ALT", Key::KEY_LEFTALT),
    ("CTRL", Key::KEY_LEFTCTRL),
    ("CONTROL", Key::KEY_LEFTCTRL),
    ("SHIFT", Key::KEY_LEFTSHIFT),
    ("SPACE", Key::KEY_SPACE),
    ("ENTER", Key::KEY_ENTER),
    ("RETURN", Key::KEY_ENTER),
    ("ESC", Key::KEY_ESC),
    ("ESCAPE", Key::KEY_ESC),
    ("TAB", Key::KEY_TAB),
    ("INSERT", Key::KEY_INSERT),
    ("DELETE", Key::KEY_DELETE),
    ("HOME", Key::KEY_HOME),
    ("END", Key::KEY_END),
    ("F1", Key::KEY_F1),
    ("F2", Key::KEY_F2),
    ("F3", Key::KEY_F3),
    ("F4", Key::KEY_F4),
    ("F5", Key::KEY_F5),
    ("F6", Key::KEY_F6),
    ("F7", Key::KEY_F7),
    ("F8", Key::KEY_F8),
    ("F9", Key::KEY_F9),
    ("F10", Key::KEY_F10),
    ("F11", Key::KEY_F11),
    ("F12", Key::KEY_F12),
    ("A", Key::KEY_A),
    ("B", Key::KEY_B),
    ("C", Key::KEY_C),
    ("D", Key::KEY_D),
    ("E", Key::KEY_E),
    ("F", Key::KEY_F),
    ("G", Key::KEY_G),
    ("H", Key::KEY_H),
    ("I", Key::KEY_I),
    ("J", Key::KEY_J),
    ("K", Key::KEY_K),
    ("L", Key::KEY_L),
    ("M", Key::KEY_M),
    ("N", Key::KEY_N),
    ("O", Key::KEY_O),
    ("P", Key::KEY_P),
    ("Q", Key::KEY_Q),
    ("R", Key::KEY_R),
    ("S", Key::KEY_S),
    ("T", Key::KEY_T),
    ("U", Key::KEY_U),
    ("V", Key::KEY_V),
    ("W", Key::KEY_W),
    ("X", Key::KEY_X),
    ("Y", Key::KEY_Y),
    ("Z", Key::KEY_Z),
    ("0", Key::KEY_0),
    ("1", Key::KEY_1),
    ("2", Key::KEY_2),
    ("3", Key::KEY_3),
    ("4", Key::KEY_4),
    ("5", Key::KEY_5),
    ("6", Key::KEY_6),
    ("7", Key::KEY_7),
    ("8", Key::KEY_8),
    ("9", Key::KEY_9),
];

/// Parses `"SUPER+ALT+E"` style chords.
pub fn parse_shortcut(shortcut: &str) -> Result<HashSet<Key>> {
    let keys = shortcut
        .split('+')
        .map(|part| {
            let name = part.trim().to_uppercase();
            NAMED_KEYS
                .iter()
                .find(|(candidate, _)| *candidate == name)
                .map(|(_, key)| *key)
                .ok_or_else(|| anyhow!("Unknown key: {}", name))
                .with_context(|| format!("Failed to parse shortcut: {}", shortcut))
        })
        .collect::<Result<HashSet<Key>>>()?;

    if keys.is_empty() {
        return Err(anyhow!("Empty shortcut"));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modifier_chords_case_insensitively() {
        let keys = parse_shortcut("super+Alt+e").unwrap();
        assert_eq!(
            keys,
            HashSet::from([Key::KEY_LEFTMETA, Key::KEY_LEFTALT, Key::KEY_E])
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(parse_shortcut("SUPER+BANANA").is_err());
        assert!(parse_shortcut("").is_err());
    }

    #[test]
    fn fires_once_per_chord_press() {
        let mut tracker = ChordTracker::new(HashSet::from([Key::KEY_LEFTCTRL, Key::KEY_E]));
        let start = Instant::now();

        assert!(!tracker.on_key(Key::KEY_LEFTCTRL, 1, start));
        assert!(tracker.on_key(Key::KEY_E, 1, start));
        assert!(!tracker.on_key(Key::KEY_E, 2, start));
        assert!(!tracker.on_key(Key::KEY_E, 0, start));

        let later = start + Duration::from_secs(1);
        assert!(tracker.on_key(Key::KEY_E, 1, later));
    }

    #[test]
    fn debounces_rapid_repeats() {
        let mut tracker = ChordTracker::new(HashSet::from([Key::KEY_F9]));
        let start = Instant::now();

        assert!(tracker.on_key(Key::KEY_F9, 1, start));
        tracker.on_key(Key::KEY_F9, 0, start);
        assert!(!tracker.on_key(Key::KEY_F9, 1, start + Duration::from_millis(200)));
    }
}
