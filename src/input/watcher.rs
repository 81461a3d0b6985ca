//! Global pointer watcher.
//!
//! A dedicated thread reads left-button presses from every pointer device and
//! turns press/release pairs that were held long enough into
//! [`SelectionEvent`]s. The thread never touches UI or clipboard state; it
//! only sends values over a channel, and only while armed.

use anyhow::Result;
use enigo::{Enigo, Mouse, Settings};
use evdev::{InputEventKind, Key};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::devices::{DeviceClass, DeviceSet};

pub const DEFAULT_HOLD_THRESHOLD: Duration = Duration::from_millis(200);

/// Screen position and time of a completed drag-select gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionEvent {
    pub x: i32,
    pub y: i32,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmPolicy {
    /// Disarm after the first qualifying gesture.
    OneShot,
    /// Stay armed; every qualifying gesture is reported.
    Continuous,
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherEvent {
    pub selection: SelectionEvent,
    pub policy: ArmPolicy,
}

/// Classifies button press/release pairs by hold duration, measured on the
/// kernel timestamps of the events rather than on when they were read.
#[derive(Debug)]
pub struct GestureClassifier {
    threshold: Duration,
    pressed_at: Option<SystemTime>,
}

impl GestureClassifier {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            pressed_at: None,
        }
    }

    pub fn press(&mut self, at: SystemTime) {
        self.pressed_at = Some(at);
    }

    /// Returns the hold duration when it strictly exceeds the threshold.
    pub fn release(&mut self, at: SystemTime) -> Option<Duration> {
        let held = at
            .duration_since(self.pressed_at.take()?)
            .unwrap_or(Duration::ZERO);
        (held > self.threshold).then_some(held)
    }

    pub fn reset(&mut self) {
        self.pressed_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmingState {
    Disarmed,
    Armed(ArmPolicy),
}

impl ArmingState {
    /// Consumes one qualifying gesture, returning the policy it fired under.
    pub fn on_gesture(&mut self) -> Option<ArmPolicy> {
        match *self {
            ArmingState::Disarmed => None,
            ArmingState::Armed(ArmPolicy::OneShot) => {
                *self = ArmingState::Disarmed;
                Some(ArmPolicy::OneShot)
            }
            ArmingState::Armed(ArmPolicy::Continuous) => Some(ArmPolicy::Continuous),
        }
    }
}

/// Sends a fired gesture. A OneShot arming is restored when the event could
/// not be delivered, so the next gesture still counts.
fn deliver(
    arming: &mut ArmingState,
    tx: &mpsc::Sender<WatcherEvent>,
    selection: SelectionEvent,
) -> bool {
    let Some(policy) = arming.on_gesture() else {
        return false;
    };
    match tx.try_send(WatcherEvent { selection, policy }) {
        Ok(()) => true,
        Err(err) => {
            warn!("Failed to send selection event: {}", err);
            if policy == ArmPolicy::OneShot {
                *arming = ArmingState::Armed(ArmPolicy::OneShot);
            }
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherCommand {
    Arm(ArmPolicy),
    Disarm,
}

/// Arms the watcher for the next selection gesture and cancels that arming.
pub trait SelectionArming: Send + Sync {
    /// Returns `false` when no gesture can be delivered.
    fn arm_once(&self) -> bool;
    fn disarm(&self);
}

/// Cloneable control handle for a running [`InputWatcher`].
#[derive(Clone)]
pub struct WatcherControl {
    commands: std_mpsc::Sender<WatcherCommand>,
}

impl WatcherControl {
    pub fn arm_continuous(&self) {
        self.send(WatcherCommand::Arm(ArmPolicy::Continuous));
    }

    fn send(&self, command: WatcherCommand) -> bool {
        if self.commands.send(command).is_err() {
            warn!("Input watcher is not running; dropping {:?}", command);
            return false;
        }
        true
    }
}

impl SelectionArming for WatcherControl {
    fn arm_once(&self) -> bool {
        self.send(WatcherCommand::Arm(ArmPolicy::OneShot))
    }

    fn disarm(&self) {
        self.send(WatcherCommand::Disarm);
    }
}

pub struct InputWatcher {
    control: WatcherControl,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InputWatcher {
    pub fn spawn(hold_threshold: Duration, tx: mpsc::Sender<WatcherEvent>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let devices = DeviceSet::open(DeviceClass::Pointer, stop.clone())?;
        if devices.is_empty() {
            warn!("Selection gestures unavailable until a pointer device appears");
        }
        let (command_tx, command_rx) = std_mpsc::channel();

        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("lifai-watcher".into())
            .spawn(move || watch_pointer(devices, hold_threshold, command_rx, tx, thread_stop))?;

        info!(
            "🖱️  Selection watcher started (hold > {} ms)",
            hold_threshold.as_millis()
        );

        Ok(Self {
            control: WatcherControl {
                commands: command_tx,
            },
            stop,
            thread: Some(thread),
        })
    }

    pub fn control(&self) -> WatcherControl {
        self.control.clone()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Input watcher thread panicked");
            }
        }
    }
}

impl Drop for InputWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_pointer(
    mut devices: DeviceSet,
    hold_threshold: Duration,
    commands: std_mpsc::Receiver<WatcherCommand>,
    tx: mpsc::Sender<WatcherEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut classifier = GestureClassifier::new(hold_threshold);
    let mut arming = ArmingState::Disarmed;
    let mut pointer = PointerLocator::new();
    let mut events = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        while let Ok(command) = commands.try_recv() {
            arming = match command {
                WatcherCommand::Arm(policy) => ArmingState::Armed(policy),
                WatcherCommand::Disarm => ArmingState::Disarmed,
            };
            debug!(?arming, "Watcher arming changed");
        }

        if devices.maintain() {
            classifier.reset();
        }
        events.clear();
        if devices.read_events(&mut events) {
            classifier.reset();
        }

        for event in &events {
            if event.kind() != InputEventKind::Key(Key::BTN_LEFT) {
                continue;
            }
            match event.value() {
                1 => classifier.press(event.timestamp()),
                0 => {
                    let Some(held) = classifier.release(event.timestamp()) else {
                        continue;
                    };
                    if arming == ArmingState::Disarmed {
                        continue;
                    }
                    let (x, y) = pointer.location();
                    debug!(x, y, held_ms = held.as_millis() as u64, "Selection gesture");
                    let selection = SelectionEvent {
                        x,
                        y,
                        timestamp: Instant::now(),
                    };
                    deliver(&mut arming, &tx, selection);
                }
                _ => {}
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    debug!("Selection watcher stopped");
}

/// Pointer position lookup; `(0, 0)` when the backend cannot report it.
struct PointerLocator {
    enigo: Option<Enigo>,
    warned: bool,
}

impl PointerLocator {
    fn new() -> Self {
        let enigo = match Enigo::new(&Settings::default()) {
            Ok(enigo) => Some(enigo),
            Err(err) => {
                warn!("Pointer position unavailable: {err:?}");
                None
            }
        };
        Self {
            enigo,
            warned: false,
        }
    }

    fn location(&mut self) -> (i32, i32) {
        let Some(enigo) = self.enigo.as_ref() else {
            return (0, 0);
        };
        match enigo.location() {
            Ok(position) => position,
            Err(err) => {
                if !self.warned {
                    warn!("Failed to read pointer position: {err:?}");
                    self.warned = true;
                }
                (0, 0)
            }
        }
    }
}
