use anyhow::Result;
use evdev::{Device, InputEvent, Key};
use std::collections::HashSet;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use udev::{EventType, MonitorBuilder};

const FALLBACK_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Which evdev nodes a [`DeviceSet`] keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Keyboard,
    Pointer,
}

impl DeviceClass {
    fn matches(self, device: &Device) -> bool {
        device.supported_keys().is_some_and(|keys| match self {
            DeviceClass::Keyboard => {
                keys.contains(Key::KEY_A) && keys.contains(Key::KEY_S) && keys.contains(Key::KEY_D)
            }
            DeviceClass::Pointer => keys.contains(Key::BTN_LEFT),
        })
    }

    fn label(self) -> &'static str {
        match self {
            DeviceClass::Keyboard => "keyboard",
            DeviceClass::Pointer => "pointer",
        }
    }
}

struct OpenDevice {
    path: PathBuf,
    device: Device,
}

#[derive(Debug, Clone)]
enum HotplugEvent {
    Added(PathBuf),
    Removed(PathBuf),
    Changed(PathBuf),
    MonitorUnavailable(String),
}

/// The open input devices of one class, kept current across hot-plug.
///
/// A udev monitor thread reports additions and removals; if udev is not
/// reachable the set falls back to rescanning `/dev/input` once a second.
pub struct DeviceSet {
    class: DeviceClass,
    devices: Vec<OpenDevice>,
    hotplug_rx: std_mpsc::Receiver<HotplugEvent>,
    fallback_rescan_enabled: bool,
    last_fallback_rescan: Instant,
}

impl DeviceSet {
    pub fn open(class: DeviceClass, stop: Arc<AtomicBool>) -> Result<Self> {
        let devices = enumerate(class, true);
        let (hotplug_tx, hotplug_rx) = std_mpsc::channel();
        std::thread::spawn(move || {
            let monitor_tx = hotplug_tx.clone();
            if let Err(err) = watch_input_devices(monitor_tx, stop) {
                let _ = hotplug_tx.send(HotplugEvent::MonitorUnavailable(err.to_string()));
            }
        });

        Ok(Self {
            class,
            devices,
            hotplug_rx,
            fallback_rescan_enabled: false,
            last_fallback_rescan: Instant::now(),
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Applies pending hot-plug notifications and the fallback rescan.
    /// Returns `true` when the set of devices changed, so callers can drop
    /// any per-device key state they were tracking.
    pub fn maintain(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::MonitorUnavailable(reason) => {
                    if !self.fallback_rescan_enabled {
                        warn!(
                            "Input device monitor unavailable ({}); falling back to periodic rescan",
                            reason
                        );
                    }
                    self.fallback_rescan_enabled = true;
                    self.last_fallback_rescan = Instant::now() - FALLBACK_RESCAN_INTERVAL;
                }
                HotplugEvent::Added(path) => changed |= self.add(path),
                HotplugEvent::Removed(path) => changed |= self.remove(&path),
                HotplugEvent::Changed(path) => {
                    self.remove(&path);
                    self.add(path);
                    changed = true;
                }
            }
        }

        if self.fallback_rescan_enabled
            && self.last_fallback_rescan.elapsed() >= FALLBACK_RESCAN_INTERVAL
        {
            self.last_fallback_rescan = Instant::now();
            self.rescan();
            changed = true;
        }

        changed
    }

    /// Reads every pending event from every device into `out`.
    /// Returns `true` when a device disappeared while reading.
    pub fn read_events(&mut self, out: &mut Vec<InputEvent>) -> bool {
        let mut removed = HashSet::new();

        for entry in &mut self.devices {
            match entry.device.fetch_events() {
                Ok(events) => out.extend(events),
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        continue;
                    }
                    error!("Error fetching events from {:?}: {}", entry.path, err);
                    if is_device_disconnect_error(&err) {
                        warn!("Input device went away; removing device");
                        removed.insert(entry.path.clone());
                    }
                }
            }
        }

        if removed.is_empty() {
            return false;
        }
        self.devices.retain(|device| !removed.contains(&device.path));
        info!(
            "Removed {} {} device(s)",
            removed.len(),
            self.class.label()
        );
        true
    }

    fn rescan(&mut self) {
        let previous = self.devices.len();
        self.devices = enumerate(self.class, false);
        let updated = self.devices.len();
        if updated != previous {
            info!(
                "{} devices refreshed - monitoring {} device(s)",
                self.class.label(),
                updated
            );
        } else {
            debug!(
                "{} devices refreshed - monitoring {} device(s)",
                self.class.label(),
                updated
            );
        }
    }

    fn add(&mut self, path: PathBuf) -> bool {
        if self.devices.iter().any(|device| device.path == path) {
            return false;
        }
        match open_device(self.class, &path) {
            Ok(Some(device)) => {
                self.devices.push(device);
                info!(
                    "{} devices refreshed - monitoring {} device(s)",
                    self.class.label(),
                    self.devices.len()
                );
                true
            }
            Ok(None) => {
                debug!("Input device added but not a {}: {:?}", self.class.label(), path);
                false
            }
            Err(err) => {
                warn!("Failed to open input device {:?}: {}", path, err);
                false
            }
        }
    }

    fn remove(&mut self, path: &Path) -> bool {
        let before = self.devices.len();
        self.devices.retain(|device| device.path != path);
        if self.devices.is_empty() {
            warn!("No {} devices found!", self.class.label());
        }
        self.devices.len() != before
    }
}

fn enumerate(class: DeviceClass, log_devices: bool) -> Vec<OpenDevice> {
    let mut found = Vec::new();

    for (path, device) in evdev::enumerate() {
        if !class.matches(&device) {
            continue;
        }
        if let Err(err) = set_device_nonblocking(&device) {
            warn!("Failed to set non-blocking mode for {:?}: {}", path, err);
        }
        if log_devices {
            let name = device.name().unwrap_or("Unknown");
            info!("Found {} device: {} at {:?}", class.label(), name, path);
        }
        found.push(OpenDevice { path, device });
    }

    if found.is_empty() {
        warn!("No {} devices found!", class.label());
        warn!("Make sure you have read permissions for /dev/input/event*");
        warn!("You may need to add your user to the 'input' group");
    }

    found
}

fn open_device(class: DeviceClass, path: &Path) -> Result<Option<OpenDevice>> {
    let device = Device::open(path)?;
    if !class.matches(&device) {
        return Ok(None);
    }
    if let Err(err) = set_device_nonblocking(&device) {
        warn!("Failed to set non-blocking mode for {:?}: {}", path, err);
    }
    info!(
        "Found {} device: {} at {:?}",
        class.label(),
        device.name().unwrap_or("Unknown"),
        path
    );
    Ok(Some(OpenDevice {
        path: path.to_path_buf(),
        device,
    }))
}

fn watch_input_devices(tx: std_mpsc::Sender<HotplugEvent>, stop: Arc<AtomicBool>) -> Result<()> {
    let monitor = MonitorBuilder::new()?.match_subsystem("input")?.listen()?;

    while !stop.load(Ordering::Relaxed) {
        let mut saw_event = false;
        for event in monitor.iter() {
            saw_event = true;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let Some(path) = event.device().devnode().map(Path::to_path_buf) else {
                continue;
            };
            if !is_input_event_node(&path) {
                continue;
            }
            let hotplug = match event.event_type() {
                EventType::Add => HotplugEvent::Added(path),
                EventType::Remove => HotplugEvent::Removed(path),
                EventType::Change => HotplugEvent::Changed(path),
                _ => continue,
            };
            if tx.send(hotplug).is_err() {
                return Ok(());
            }
        }
        if !saw_event {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    Ok(())
}

fn is_device_disconnect_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::ENODEV || code == libc::EBADF || code == libc::ENXIO
    )
}

fn set_device_nonblocking(device: &Device) -> Result<()> {
    let fd = device.as_raw_fd();

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(anyhow::anyhow!(
            "fcntl(F_GETFL) failed: {}",
            io::Error::last_os_error()
        ));
    }
    if (flags & libc::O_NONBLOCK) != 0 {
        return Ok(());
    }

    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(anyhow::anyhow!(
            "fcntl(F_SETFL) failed: {}",
            io::Error::last_os_error()
        ));
    }

    Ok(())
}

fn is_input_event_node(path: &Path) -> bool {
    path.to_str()
        .is_some_and(|node| node.starts_with("/dev/input/event"))
}
