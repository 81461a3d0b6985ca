use anyhow::{anyhow, Context, Result};
use enigo::{Enigo, Mouse, Settings};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigManager};
use crate::controller::{self, ControllerHandle, ControllerState, TriggerStyle};
use crate::generation::OllamaClient;
use crate::input::{
    ArmPolicy, ClipboardBridge, GlobalShortcut, InputWatcher, SelectionArming, ShortcutEvent,
    SystemClipboard, SystemKeystrokes, WatcherControl, WatcherEvent,
};
use crate::prompts::PromptRegistry;
use crate::status::StatusWriter;
use crate::ui::{self, DesktopPresenter, UiDispatcher, UiLoop};

const FALLBACK_SCREEN: (i32, i32) = (1920, 1080);

struct ShortcutListener {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    shortcut: String,
}

impl ShortcutListener {
    fn spawn(shortcut: String, tx: mpsc::Sender<ShortcutEvent>) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let runner_flag = Arc::clone(&stop_flag);
        let runner_shortcut = shortcut.clone();

        let handle = thread::spawn(move || {
            match GlobalShortcut::new(&runner_shortcut, Arc::clone(&runner_flag)) {
                Ok(listener) => {
                    if let Err(e) = listener.run(tx, runner_flag) {
                        error!("Global shortcut error: {}", e);
                    }
                }
                Err(e) => error!("Failed to initialize global shortcut: {}", e),
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
            shortcut,
        }
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.join() {
                error!("Shortcut listener thread panicked: {:?}", err);
            }
        }
    }
}

impl Drop for ShortcutListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Arming handle that tolerates a missing pointer watcher.
#[derive(Clone, Default)]
struct WatcherArming(Option<WatcherControl>);

impl SelectionArming for WatcherArming {
    fn arm_once(&self) -> bool {
        match &self.0 {
            Some(control) => control.arm_once(),
            None => {
                warn!("Selection watcher unavailable; use the immediate trigger style");
                false
            }
        }
    }

    fn disarm(&self) {
        if let Some(control) = &self.0 {
            control.disarm();
        }
    }
}

fn detect_screen(config: &Config) -> (i32, i32) {
    if let Some(screen) = config.toolbar.screen {
        return screen;
    }
    match Enigo::new(&Settings::default()).map(|enigo| enigo.main_display()) {
        Ok(Ok(screen)) => screen,
        _ => {
            debug!("Screen size unavailable; assuming {:?}", FALLBACK_SCREEN);
            FALLBACK_SCREEN
        }
    }
}

fn build_bridge(config: &Config) -> Result<ClipboardBridge> {
    let clipboard = SystemClipboard::new().context("Failed to open the system clipboard")?;
    let keys = SystemKeystrokes::new(
        config.clipboard.shift_paste,
        config.clipboard.global_shortcuts,
        config.clipboard.paste_hints.shift.clone(),
    );
    Ok(ClipboardBridge::new(
        Box::new(clipboard),
        Box::new(keys),
        config.settle_timing(),
    ))
}

pub struct LifaiApp {
    config_manager: ConfigManager,
    current_config: Config,
    pending_config: Option<Config>,
    prompt_override: Option<String>,
    registry: PromptRegistry,
    controller: ControllerHandle,
    ui: UiDispatcher,
    ui_loop: Option<UiLoop>,
    status_writer: StatusWriter,
    watcher: Option<InputWatcher>,
    watcher_rx: Option<mpsc::Receiver<WatcherEvent>>,
    shortcut_tx: mpsc::Sender<ShortcutEvent>,
    shortcut_rx: Option<mpsc::Receiver<ShortcutEvent>>,
    shortcut_listener: Option<ShortcutListener>,
}

impl LifaiApp {
    pub fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.get();
        let registry = PromptRegistry::from_overrides(&config.prompts);
        if registry.resolve(&config.trigger.default_prompt).is_none() {
            warn!(
                "Default prompt '{}' is not defined; shortcut triggers will fail",
                config.trigger.default_prompt
            );
        }

        let client = OllamaClient::new(&config.ollama.base_url)?;
        info!("🤖 Generation endpoint: {}", client.endpoint());

        let bridge = build_bridge(&config)?;

        let status_writer = StatusWriter::new()?;
        let presenter = DesktopPresenter::new(
            StatusWriter::new()?,
            config.toolbar_geometry(),
            detect_screen(&config),
            config.notifications,
        );
        let (ui, ui_loop) = ui::channel(Box::new(presenter));

        let (watcher_tx, watcher_rx) = mpsc::channel(10);
        let watcher = match InputWatcher::spawn(config.hold_threshold(), watcher_tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!("Selection watcher disabled: {:#}", err);
                None
            }
        };
        let arming = WatcherArming(watcher.as_ref().map(InputWatcher::control));

        let (controller, _task) = controller::spawn(
            registry.clone(),
            bridge,
            client,
            arming,
            ui.clone(),
            config.controller_settings(),
        );

        let (shortcut_tx, shortcut_rx) = mpsc::channel(10);

        Ok(Self {
            config_manager,
            current_config: config,
            pending_config: None,
            prompt_override: None,
            registry,
            controller,
            ui,
            ui_loop: Some(ui_loop),
            status_writer,
            watcher,
            watcher_rx: Some(watcher_rx),
            shortcut_tx,
            shortcut_rx: Some(shortcut_rx),
            shortcut_listener: None,
        })
    }

    /// Replaces the configured default prompt for shortcut triggers.
    pub fn set_prompt_override(&mut self, prompt: Option<String>) {
        if let Some(name) = prompt.as_deref() {
            if self.registry.resolve(name).is_none() {
                warn!("Prompt '{}' is not defined; shortcut triggers will fail", name);
            }
        }
        self.prompt_override = prompt;
    }

    pub fn default_prompt(&self) -> &str {
        self.prompt_override
            .as_deref()
            .unwrap_or(&self.current_config.trigger.default_prompt)
    }

    /// Handle for sending triggers from outside the event loop.
    pub fn controller(&self) -> ControllerHandle {
        self.controller.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("🚀 lifai running!");

        let mut ui_loop = self
            .ui_loop
            .take()
            .ok_or_else(|| anyhow!("UI loop already running"))?;
        let mut shortcut_rx = self
            .shortcut_rx
            .take()
            .ok_or_else(|| anyhow!("shortcut receiver already consumed"))?;
        let mut watcher_rx = self
            .watcher_rx
            .take()
            .ok_or_else(|| anyhow!("watcher receiver already consumed"))?;

        let shortcut = self.current_config.shortcut().map(str::to_string);
        self.ensure_shortcut_listener(shortcut);
        self.apply_follow_selection();

        let mut config_rx = self.config_manager.subscribe();
        let mut state_rx = self.controller.subscribe_state();
        let mut prompts_rx = self.registry.subscribe();

        loop {
            tokio::select! {
                Some(job) = ui_loop.next_job() => ui_loop.run_job(job),
                Some(event) = shortcut_rx.recv() => self.handle_shortcut(event),
                Some(event) = watcher_rx.recv() => self.handle_watcher_event(event),
                result = state_rx.changed() => {
                    if result.is_err() {
                        info!("Controller stopped");
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    if state == ControllerState::Idle {
                        self.on_idle();
                    }
                }
                result = config_rx.changed() => {
                    match result {
                        Ok(()) => {
                            let updated = config_rx.borrow_and_update().clone();
                            if let Err(err) = self.apply_config_update(updated) {
                                error!("Failed to apply config update: {}", err);
                            }
                        }
                        Err(_) => {
                            info!("Configuration watcher closed");
                            break;
                        }
                    }
                }
                Ok(()) = prompts_rx.changed() => {
                    let names = prompts_rx.borrow_and_update().clone();
                    debug!(count = names.len(), "Prompt registry changed");
                }
                else => break,
            }
        }

        Ok(())
    }

    pub fn cleanup(&mut self) {
        if let Some(listener) = self.shortcut_listener.as_mut() {
            listener.stop();
        }
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.stop();
        }
        if let Err(err) = self.status_writer.cleanup() {
            warn!("Failed to clean up status files: {}", err);
        }
    }

    fn handle_shortcut(&mut self, event: ShortcutEvent) {
        debug!(elapsed = ?event.triggered_at.elapsed(), "Shortcut event");
        let style = TriggerStyle::from(self.current_config.trigger.style);
        self.controller.shortcut(self.default_prompt().to_string(), style);
    }

    fn handle_watcher_event(&mut self, event: WatcherEvent) {
        let selection = event.selection;
        match event.policy {
            ArmPolicy::OneShot => {
                self.controller.selection(selection);
            }
            ArmPolicy::Continuous => {
                if self.controller.state() == ControllerState::Idle {
                    self.ui.show_at(selection.x, selection.y);
                }
            }
        }
    }

    fn on_idle(&mut self) {
        if let Some(config) = self.pending_config.take() {
            if let Err(err) = self.apply_config_update(config) {
                error!("Failed to apply deferred config update: {}", err);
            }
        }
        self.apply_follow_selection();
    }

    fn apply_follow_selection(&self) {
        let Some(watcher) = self.watcher.as_ref() else {
            return;
        };
        if self.current_config.trigger.follow_selection {
            watcher.control().arm_continuous();
        }
    }

    fn ensure_shortcut_listener(&mut self, shortcut: Option<String>) {
        match shortcut {
            Some(target) => {
                if self
                    .shortcut_listener
                    .as_ref()
                    .is_some_and(|listener| listener.shortcut == target)
                {
                    return;
                }
                if let Some(listener) = self.shortcut_listener.as_mut() {
                    listener.stop();
                }
                info!("⌨️  Trigger shortcut: {}", target);
                self.shortcut_listener =
                    Some(ShortcutListener::spawn(target, self.shortcut_tx.clone()));
            }
            None => {
                if let Some(listener) = self.shortcut_listener.as_mut() {
                    listener.stop();
                }
                self.shortcut_listener = None;
                info!("⌨️  Trigger shortcut: disabled");
            }
        }
    }

    fn apply_config_update(&mut self, new_config: Config) -> Result<()> {
        debug!(?new_config, "Apply config update requested");
        if new_config == self.current_config {
            debug!("Config unchanged; ignoring update");
            return Ok(());
        }

        if self.controller.state() != ControllerState::Idle {
            info!("Deferring config refresh until the current enhancement finishes");
            self.pending_config = Some(new_config);
            return Ok(());
        }

        let old = std::mem::replace(&mut self.current_config, new_config);
        let new = &self.current_config;

        if new.prompts != old.prompts {
            self.registry.apply_overrides(&new.prompts);
        }

        if new.controller_settings() != old.controller_settings() {
            self.controller.update_settings(new.controller_settings());
        }

        if new.ollama.base_url != old.ollama.base_url
            || new.clipboard.shift_paste != old.clipboard.shift_paste
            || new.clipboard.global_shortcuts != old.clipboard.global_shortcuts
            || new.clipboard.paste_hints != old.clipboard.paste_hints
            || new.toolbar != old.toolbar
            || new.notifications != old.notifications
        {
            warn!("Endpoint, keystroke and toolbar changes take effect after a restart");
        }

        if new.trigger.hold_threshold_ms != old.trigger.hold_threshold_ms {
            warn!("Hold threshold changes take effect after a restart");
        }

        if new.trigger.follow_selection != old.trigger.follow_selection {
            if let Some(watcher) = self.watcher.as_ref() {
                if new.trigger.follow_selection {
                    watcher.control().arm_continuous();
                } else {
                    watcher.control().disarm();
                }
            }
        }

        let shortcut = new.shortcut().map(str::to_string);
        self.ensure_shortcut_listener(shortcut);

        info!("✅ Configuration applied");
        Ok(())
    }
}
