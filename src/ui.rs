//! Presentation adapter.
//!
//! Everything that changes what the user sees goes through [`UiDispatcher`],
//! which queues closures for the [`UiLoop`]. The loop runs inside the
//! daemon's main event loop and is the only owner of the [`Presenter`].

use std::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::status::{StatusWriter, ToolbarStatus, WaybarState};

pub trait Presenter {
    fn show_at(&mut self, x: i32, y: i32);
    fn hide(&mut self);
    fn set_affordance_enabled(&mut self, enabled: bool);
    fn show_error(&mut self, message: &str);
}

pub type UiJob = Box<dyn FnOnce(&mut dyn Presenter) + Send>;

/// Cloneable handle for scheduling work on the UI loop.
#[derive(Clone)]
pub struct UiDispatcher {
    jobs: mpsc::UnboundedSender<UiJob>,
}

impl UiDispatcher {
    pub fn run_on_ui_thread<F>(&self, job: F)
    where
        F: FnOnce(&mut dyn Presenter) + Send + 'static,
    {
        if self.jobs.send(Box::new(job)).is_err() {
            debug!("UI loop has shut down; dropping UI job");
        }
    }

    pub fn show_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.run_on_ui_thread(move |presenter| presenter.show_error(&message));
    }

    pub fn set_affordance_enabled(&self, enabled: bool) {
        self.run_on_ui_thread(move |presenter| presenter.set_affordance_enabled(enabled));
    }

    pub fn show_at(&self, x: i32, y: i32) {
        self.run_on_ui_thread(move |presenter| presenter.show_at(x, y));
    }

    pub fn hide(&self) {
        self.run_on_ui_thread(|presenter| presenter.hide());
    }
}

pub struct UiLoop {
    presenter: Box<dyn Presenter>,
    jobs: mpsc::UnboundedReceiver<UiJob>,
}

pub fn channel(presenter: Box<dyn Presenter>) -> (UiDispatcher, UiLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        UiDispatcher { jobs: tx },
        UiLoop {
            presenter,
            jobs: rx,
        },
    )
}

impl UiLoop {
    /// Waits for the next queued job. `None` once every dispatcher is gone.
    pub async fn next_job(&mut self) -> Option<UiJob> {
        self.jobs.recv().await
    }

    pub fn run_job(&mut self, job: UiJob) {
        job(self.presenter.as_mut());
    }

    /// Runs every job queued so far without waiting.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.jobs.try_recv() {
            self.run_job(job);
            ran += 1;
        }
        ran
    }
}

/// Toolbar size and placement relative to the pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolbarGeometry {
    pub width: i32,
    pub height: i32,
    pub offset_x: i32,
    pub offset_y: i32,
}

impl Default for ToolbarGeometry {
    fn default() -> Self {
        Self {
            width: 240,
            height: 40,
            offset_x: 30,
            offset_y: 20,
        }
    }
}

/// Places the toolbar above and left of the pointer, kept inside the screen.
pub fn clamp_to_screen(
    pointer: (i32, i32),
    geometry: ToolbarGeometry,
    screen: (i32, i32),
) -> (i32, i32) {
    let (x, y) = pointer;
    let (screen_width, screen_height) = screen;
    let x = (x - geometry.offset_x)
        .min(screen_width - geometry.width)
        .max(0);
    let y = (y - geometry.height - geometry.offset_y)
        .min(screen_height - geometry.height)
        .max(0);
    (x, y)
}

/// Default presenter: Waybar status, a toolbar position file and
/// desktop notifications for errors.
pub struct DesktopPresenter {
    status: StatusWriter,
    toolbar: ToolbarStatus,
    geometry: ToolbarGeometry,
    screen: (i32, i32),
    notifications: bool,
}

impl DesktopPresenter {
    pub fn new(
        status: StatusWriter,
        geometry: ToolbarGeometry,
        screen: (i32, i32),
        notifications: bool,
    ) -> Self {
        let presenter = Self {
            status,
            toolbar: ToolbarStatus::default(),
            geometry,
            screen,
            notifications,
        };
        presenter.write_state(WaybarState::Idle, "Ready");
        presenter
    }

    fn write_state(&self, state: WaybarState, tooltip: &str) {
        if let Err(err) = self.status.set_state(state, tooltip) {
            warn!("Failed to update status: {}", err);
        }
    }

    fn write_toolbar(&self) {
        if let Err(err) = self.status.set_toolbar(self.toolbar) {
            warn!("Failed to update toolbar: {}", err);
        }
    }

    fn notify(&self, message: &str) {
        if !self.notifications {
            return;
        }
        let result = Command::new("notify-send")
            .args(["--app-name=lifai-rs", "--urgency=normal", "LifAi", message])
            .spawn();
        if let Err(err) = result {
            debug!("Failed to raise desktop notification: {}", err);
        }
    }
}

impl Presenter for DesktopPresenter {
    fn show_at(&mut self, x: i32, y: i32) {
        let (x, y) = clamp_to_screen((x, y), self.geometry, self.screen);
        self.toolbar.visible = true;
        self.toolbar.x = x;
        self.toolbar.y = y;
        self.write_toolbar();
    }

    fn hide(&mut self) {
        if self.toolbar.visible {
            self.toolbar.visible = false;
            self.write_toolbar();
        }
    }

    fn set_affordance_enabled(&mut self, enabled: bool) {
        self.toolbar.enabled = enabled;
        self.write_toolbar();
        if enabled {
            self.write_state(WaybarState::Idle, "Ready");
        } else {
            self.write_state(WaybarState::Busy, "Enhancing selection...");
        }
    }

    fn show_error(&mut self, message: &str) {
        warn!("❌ {}", message);
        if let Err(err) = self.status.set_error(message) {
            warn!("Failed to update status: {}", err);
        }
        self.notify(message);
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum UiCall {
        ShowAt(i32, i32),
        Hide,
        Affordance(bool),
        Error(String),
    }

    /// Records every presenter call into a shared log.
    #[derive(Clone, Default)]
    pub struct RecordingPresenter {
        pub calls: Arc<Mutex<Vec<UiCall>>>,
    }

    impl RecordingPresenter {
        pub fn calls(&self) -> Vec<UiCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn errors(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    UiCall::Error(message) => Some(message),
                    _ => None,
                })
                .collect()
        }

        pub fn affordance(&self) -> Option<bool> {
            self.calls().into_iter().rev().find_map(|call| match call {
                UiCall::Affordance(enabled) => Some(enabled),
                _ => None,
            })
        }
    }

    impl Presenter for RecordingPresenter {
        fn show_at(&mut self, x: i32, y: i32) {
            self.calls.lock().unwrap().push(UiCall::ShowAt(x, y));
        }

        fn hide(&mut self) {
            self.calls.lock().unwrap().push(UiCall::Hide);
        }

        fn set_affordance_enabled(&mut self, enabled: bool) {
            self.calls.lock().unwrap().push(UiCall::Affordance(enabled));
        }

        fn show_error(&mut self, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(UiCall::Error(message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    const SCREEN: (i32, i32) = (1920, 1080);

    #[test]
    fn toolbar_sits_above_left_of_pointer() {
        let geometry = ToolbarGeometry::default();
        assert_eq!(clamp_to_screen((500, 500), geometry, SCREEN), (470, 440));
    }

    #[test]
    fn toolbar_is_clamped_to_screen_edges() {
        let geometry = ToolbarGeometry::default();
        assert_eq!(clamp_to_screen((10, 10), geometry, SCREEN), (0, 0));
        assert_eq!(clamp_to_screen((1919, 1079), geometry, SCREEN), (1680, 1019));
        assert_eq!(clamp_to_screen((1919, 40), geometry, SCREEN), (1680, 0));
    }

    #[test]
    fn jobs_run_in_order_on_the_loop() {
        let presenter = RecordingPresenter::default();
        let (dispatcher, mut ui_loop) = channel(Box::new(presenter.clone()));

        dispatcher.set_affordance_enabled(false);
        dispatcher.hide();
        dispatcher.show_error("boom");
        assert!(presenter.calls().is_empty());

        assert_eq!(ui_loop.run_pending(), 3);
        assert_eq!(
            presenter.calls(),
            vec![
                UiCall::Affordance(false),
                UiCall::Hide,
                UiCall::Error("boom".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn next_job_ends_when_dispatchers_drop() {
        let (dispatcher, mut ui_loop) = channel(Box::new(RecordingPresenter::default()));
        dispatcher.show_at(1, 2);
        drop(dispatcher);

        let job = ui_loop.next_job().await.expect("queued job");
        ui_loop.run_job(job);
        assert!(ui_loop.next_job().await.is_none());
    }
}
