//! Enhancement request controller.
//!
//! A single actor task owns the [`ControllerState`]. Triggers, selection
//! gestures and cancellations arrive through one bounded command channel;
//! clipboard work and the model call run on worker tasks that report back
//! through a second channel. Only the actor mutates state, and every path
//! through a cycle ends in [`ControllerState::Idle`] with the affordance
//! enabled again.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::benchmark::CycleBenchmark;
use crate::generation::{clean_generated_text, GenError, GenerationClient};
use crate::input::clipboard::{
    CaptureReport, ClipboardBridge, ClipboardError, ClipboardPhase, SettleTiming,
};
use crate::input::watcher::{SelectionArming, SelectionEvent};
use crate::prompts::{PromptRegistry, TemplateError, TemplateRef};
use crate::ui::UiDispatcher;

const COMMAND_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    AwaitingSelection,
    Processing,
}

impl ControllerState {
    pub fn allows(self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Idle, AwaitingSelection)
                | (AwaitingSelection, Processing)
                | (AwaitingSelection, Idle)
                | (Processing, Idle)
        )
    }

    pub fn affordance_enabled(self) -> bool {
        self == ControllerState::Idle
    }
}

/// How a trigger obtains its selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStyle {
    /// Copy whatever is selected right now.
    Immediate,
    /// Arm the watcher and copy after the next drag-select.
    Armed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Clipboard(ClipboardPhase),
    Template,
    Connection,
    Status(u16),
    MalformedResponse,
    Timeout,
    Worker,
    /// The selection watcher could not be armed.
    Arming,
}

impl From<&GenError> for ErrorKind {
    fn from(err: &GenError) -> Self {
        match err {
            GenError::Connection(_) => ErrorKind::Connection,
            GenError::Status(code) => ErrorKind::Status(*code),
            GenError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            GenError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnhancementOutcome {
    Success { text: String },
    Failure { kind: ErrorKind, detail: String },
}

impl EnhancementOutcome {
    fn failure(kind: ErrorKind, detail: impl fmt::Display) -> Self {
        EnhancementOutcome::Failure {
            kind,
            detail: detail.to_string(),
        }
    }
}

impl From<GenError> for EnhancementOutcome {
    fn from(err: GenError) -> Self {
        EnhancementOutcome::failure(ErrorKind::from(&err), err)
    }
}

/// One attempt at rewriting a captured selection.
#[derive(Debug, Clone)]
pub struct EnhancementRequest {
    pub template: TemplateRef,
    pub captured_text: String,
    pub model_id: String,
}

impl EnhancementRequest {
    pub fn prompt(&self) -> Result<String, TemplateError> {
        self.template.render(&self.captured_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub model: String,
    pub request_timeout: Duration,
    /// Pause between the end of a drag-select and the synthetic copy.
    pub selection_delay: Duration,
    pub clipboard: SettleTiming,
    pub log_timings: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            model: "llama2".to_string(),
            request_timeout: Duration::from_secs(60),
            selection_delay: Duration::from_millis(200),
            clipboard: SettleTiming::default(),
            log_timings: false,
        }
    }
}

#[derive(Debug)]
pub enum ControllerCommand {
    Trigger { prompt: String, style: TriggerStyle },
    /// A shortcut press: cancels a pending armed cycle, otherwise triggers.
    Shortcut { prompt: String, style: TriggerStyle },
    Selection(SelectionEvent),
    Cancel,
    UpdateSettings(ControllerSettings),
}

/// Cloneable front door to the controller actor.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControllerCommand>,
    state: watch::Receiver<ControllerState>,
}

impl ControllerHandle {
    pub fn trigger(&self, prompt: impl Into<String>, style: TriggerStyle) -> bool {
        self.send(ControllerCommand::Trigger {
            prompt: prompt.into(),
            style,
        })
    }

    pub fn shortcut(&self, prompt: impl Into<String>, style: TriggerStyle) -> bool {
        self.send(ControllerCommand::Shortcut {
            prompt: prompt.into(),
            style,
        })
    }

    pub fn selection(&self, event: SelectionEvent) -> bool {
        self.send(ControllerCommand::Selection(event))
    }

    pub fn cancel(&self) -> bool {
        self.send(ControllerCommand::Cancel)
    }

    pub fn update_settings(&self, settings: ControllerSettings) -> bool {
        self.send(ControllerCommand::UpdateSettings(settings))
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    fn send(&self, command: ControllerCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!("Controller queue full; dropping {:?}", command);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Controller has stopped");
                false
            }
        }
    }
}

/// Starts the controller actor on the current runtime.
pub fn spawn<G, A>(
    registry: PromptRegistry,
    bridge: ClipboardBridge,
    client: G,
    arming: A,
    ui: UiDispatcher,
    settings: ControllerSettings,
) -> (ControllerHandle, JoinHandle<()>)
where
    G: GenerationClient,
    A: SelectionArming + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state_rx) = watch::channel(ControllerState::Idle);
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();

    let controller = Controller {
        state: ControllerState::Idle,
        state_tx,
        settings,
        registry,
        bridge: Arc::new(Mutex::new(bridge)),
        client: Arc::new(client),
        arming,
        ui,
        commands: command_rx,
        reports_tx,
        reports_rx,
        cycle: None,
        next_cycle_id: 0,
    };
    let task = tokio::spawn(controller.run());

    (
        ControllerHandle {
            commands: command_tx,
            state: state_rx,
        },
        task,
    )
}

enum StageReport {
    Captured {
        cycle: u64,
        elapsed: Duration,
        result: Result<CaptureReport, ClipboardError>,
    },
    Finished {
        cycle: u64,
        report: CycleReport,
    },
}

impl StageReport {
    fn cycle(&self) -> u64 {
        match self {
            StageReport::Captured { cycle, .. } | StageReport::Finished { cycle, .. } => *cycle,
        }
    }
}

struct Injection {
    elapsed: Duration,
    result: Result<(), ClipboardError>,
}

struct CycleReport {
    outcome: EnhancementOutcome,
    generation: Option<Duration>,
    injection: Option<Injection>,
}

impl CycleReport {
    fn failed(outcome: EnhancementOutcome, generation: Option<Duration>) -> Self {
        Self {
            outcome,
            generation,
            injection: None,
        }
    }
}

struct Cycle {
    id: u64,
    template: TemplateRef,
    style: TriggerStyle,
    settings: ControllerSettings,
    capture_started: bool,
    bench: CycleBenchmark,
}

struct Controller<G, A> {
    state: ControllerState,
    state_tx: watch::Sender<ControllerState>,
    settings: ControllerSettings,
    registry: PromptRegistry,
    bridge: Arc<Mutex<ClipboardBridge>>,
    client: Arc<G>,
    arming: A,
    ui: UiDispatcher,
    commands: mpsc::Receiver<ControllerCommand>,
    reports_tx: mpsc::UnboundedSender<StageReport>,
    reports_rx: mpsc::UnboundedReceiver<StageReport>,
    cycle: Option<Cycle>,
    next_cycle_id: u64,
}

impl<G, A> Controller<G, A>
where
    G: GenerationClient,
    A: SelectionArming,
{
    async fn run(mut self) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                Some(report) = self.reports_rx.recv() => self.handle_report(report),
            }

            if !commands_open && self.cycle.is_none() {
                break;
            }
        }
        debug!("Controller stopped");
    }

    fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Trigger { prompt, style } => self.on_trigger(prompt, style),
            ControllerCommand::Shortcut { prompt, style } => {
                if self.awaiting_gesture() {
                    self.on_cancel();
                } else {
                    self.on_trigger(prompt, style);
                }
            }
            ControllerCommand::Selection(event) => self.on_selection(event),
            ControllerCommand::Cancel => self.on_cancel(),
            ControllerCommand::UpdateSettings(settings) => {
                debug!(?settings, "Controller settings updated");
                self.settings = settings;
            }
        }
    }

    fn on_trigger(&mut self, prompt: String, style: TriggerStyle) {
        if self.state != ControllerState::Idle {
            info!("⏳ Busy; ignoring trigger for '{}'", prompt);
            return;
        }
        let Some(template) = self.registry.resolve(&prompt) else {
            self.ui.show_error(format!("Unknown prompt '{prompt}'"));
            return;
        };

        self.ui.set_affordance_enabled(false);
        self.ui.hide();
        self.transition(ControllerState::AwaitingSelection);

        self.next_cycle_id += 1;
        let settings = self.settings.clone();
        let bench = CycleBenchmark::new(template.name(), settings.model.as_str(), Instant::now());
        info!("✨ Enhancing with '{}'", template.name());
        self.cycle = Some(Cycle {
            id: self.next_cycle_id,
            template,
            style,
            settings,
            capture_started: false,
            bench,
        });

        match style {
            TriggerStyle::Immediate => self.start_capture(Duration::ZERO),
            TriggerStyle::Armed => {
                if self.arming.arm_once() {
                    info!("👆 Select the text to enhance");
                } else {
                    self.fail(
                        ErrorKind::Arming,
                        "Selection watcher unavailable; cannot wait for a selection",
                    );
                }
            }
        }
    }

    /// Armed cycle still waiting for its drag-select gesture.
    fn awaiting_gesture(&self) -> bool {
        self.state == ControllerState::AwaitingSelection
            && self
                .cycle
                .as_ref()
                .is_some_and(|cycle| cycle.style == TriggerStyle::Armed && !cycle.capture_started)
    }

    fn on_selection(&mut self, event: SelectionEvent) {
        if !self.awaiting_gesture() {
            debug!(x = event.x, y = event.y, "Selection ignored; not waiting for one");
            return;
        }

        debug!(x = event.x, y = event.y, "Selection received");
        let delay = self
            .cycle
            .as_ref()
            .map(|cycle| cycle.settings.selection_delay)
            .unwrap_or_default();
        self.start_capture(delay);
    }

    fn on_cancel(&mut self) {
        let cancellable = self.state == ControllerState::AwaitingSelection
            && self.cycle.as_ref().is_some_and(|cycle| !cycle.capture_started);
        if !cancellable {
            debug!(state = ?self.state, "Nothing to cancel");
            return;
        }

        self.arming.disarm();
        info!("🚫 Enhancement cancelled");
        self.finish_cycle();
    }

    fn start_capture(&mut self, delay: Duration) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        cycle.capture_started = true;
        let id = cycle.id;
        let timing = cycle.settings.clipboard;
        let bridge = Arc::clone(&self.bridge);
        let reports = self.reports_tx.clone();

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                let mut bridge = lock(&bridge);
                bridge.set_timing(timing);
                bridge.capture_selection()
            })
            .await
            .unwrap_or_else(|err| {
                Err(ClipboardError::worker(ClipboardPhase::Capture, err.to_string()))
            });
            let _ = reports.send(StageReport::Captured {
                cycle: id,
                elapsed: started.elapsed(),
                result,
            });
        });
    }

    fn handle_report(&mut self, report: StageReport) {
        let id = report.cycle();
        if self.cycle.as_ref().map(|cycle| cycle.id) != Some(id) {
            debug!(cycle = id, "Dropping report from a finished cycle");
            return;
        }

        match report {
            StageReport::Captured {
                elapsed, result, ..
            } => self.on_captured(elapsed, result),
            StageReport::Finished { report, .. } => self.on_finished(report),
        }
    }

    fn on_captured(&mut self, elapsed: Duration, result: Result<CaptureReport, ClipboardError>) {
        let captured = match result {
            Ok(captured) => captured,
            Err(err) => {
                self.record_capture(elapsed, None);
                self.fail(ErrorKind::Clipboard(err.phase()), err);
                return;
            }
        };
        self.record_capture(elapsed, captured.text.as_ref().map(|text| text.chars().count()));

        if let Some(restore_error) = captured.restore_error {
            self.ui.show_error(restore_error.to_string());
        }

        let Some(text) = captured.text else {
            info!("No text selected; nothing to enhance");
            self.finish_cycle();
            return;
        };

        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };
        let request = EnhancementRequest {
            template: Arc::clone(&cycle.template),
            captured_text: text,
            model_id: cycle.settings.model.clone(),
        };
        let timeout = cycle.settings.request_timeout;
        let id = cycle.id;

        self.transition(ControllerState::Processing);
        let prompt = match request.prompt() {
            Ok(prompt) => prompt,
            Err(err) => {
                self.fail(ErrorKind::Template, err);
                return;
            }
        };

        info!(
            model = request.model_id.as_str(),
            chars = request.captured_text.chars().count(),
            "🤖 Sending selection to the model"
        );
        self.start_generation(id, prompt, request.model_id, timeout);
    }

    fn start_generation(&self, id: u64, prompt: String, model: String, timeout: Duration) {
        let client = Arc::clone(&self.client);
        let bridge = Arc::clone(&self.bridge);
        let reports = self.reports_tx.clone();

        let work = tokio::spawn(generate_and_inject(client, bridge, prompt, model, timeout));
        tokio::spawn(async move {
            let report = work.await.unwrap_or_else(|err| {
                let detail = format!("enhancement worker failed: {err}");
                CycleReport::failed(EnhancementOutcome::failure(ErrorKind::Worker, detail), None)
            });
            let _ = reports.send(StageReport::Finished { cycle: id, report });
        });
    }

    fn on_finished(&mut self, report: CycleReport) {
        if let Some(cycle) = self.cycle.as_mut() {
            let generated = match &report.outcome {
                EnhancementOutcome::Success { text } => Some(text.chars().count()),
                EnhancementOutcome::Failure { .. } => None,
            };
            if let Some(generation) = report.generation {
                cycle.bench.record_generation(generation, generated);
            }
            if let Some(injection) = &report.injection {
                cycle.bench.record_inject(injection.elapsed);
            }
        }

        match report.outcome {
            EnhancementOutcome::Failure { kind, detail } => {
                debug!(?kind, "Enhancement failed");
                self.ui.show_error(detail);
            }
            EnhancementOutcome::Success { .. } => match report.injection.map(|i| i.result) {
                Some(Err(err)) => self.ui.show_error(err.to_string()),
                _ => info!("✅ Selection replaced"),
            },
        }
        self.finish_cycle();
    }

    fn fail(&mut self, kind: ErrorKind, detail: impl fmt::Display) {
        debug!(?kind, "Enhancement failed");
        self.ui.show_error(detail.to_string());
        self.finish_cycle();
    }

    fn record_capture(&mut self, elapsed: Duration, chars: Option<usize>) {
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.bench.record_capture(elapsed, chars);
        }
    }

    fn finish_cycle(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            let mut bench = cycle.bench;
            bench.mark_finished(Instant::now());
            if cycle.settings.log_timings {
                if let Some(summary) = bench.finalize() {
                    info!("\n{}", summary);
                }
            }
        }
        self.ui.set_affordance_enabled(true);
        self.transition(ControllerState::Idle);
    }

    fn transition(&mut self, next: ControllerState) -> bool {
        if !self.state.allows(next) {
            warn!(from = ?self.state, to = ?next, "Ignoring illegal state transition");
            return false;
        }
        debug!(from = ?self.state, to = ?next, "Controller state change");
        self.state = next;
        self.state_tx.send_replace(next);
        true
    }
}

async fn generate_and_inject<G: GenerationClient>(
    client: Arc<G>,
    bridge: Arc<Mutex<ClipboardBridge>>,
    prompt: String,
    model: String,
    timeout: Duration,
) -> CycleReport {
    let started = Instant::now();
    let generated = client.generate(&prompt, &model, timeout).await;
    let generation = Some(started.elapsed());

    let text = match generated {
        Ok(raw) => clean_generated_text(&raw),
        Err(err) => return CycleReport::failed(err.into(), generation),
    };
    if text.is_empty() {
        return CycleReport::failed(
            GenError::MalformedResponse("model returned no text".to_string()).into(),
            generation,
        );
    }

    let started = Instant::now();
    let replacement = text.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut bridge = lock(&bridge);
        bridge.inject_replacement(&replacement)
    })
    .await
    .unwrap_or_else(|err| Err(ClipboardError::worker(ClipboardPhase::Inject, err.to_string())));

    CycleReport {
        outcome: EnhancementOutcome::Success { text },
        generation,
        injection: Some(Injection {
            elapsed: started.elapsed(),
            result,
        }),
    }
}

fn lock(bridge: &Mutex<ClipboardBridge>) -> std::sync::MutexGuard<'_, ClipboardBridge> {
    bridge.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::clipboard::fakes::{bridge, desktop, instant_timing, SharedDesktop};
    use crate::input::clipboard::ClipboardSnapshot;
    use crate::prompts::DEFAULT_PROMPT;
    use crate::ui::fakes::RecordingPresenter;
    use crate::ui::{self, UiLoop};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Clone)]
    enum Script {
        Reply(&'static str),
        Timeout,
        Status(u16),
        Panic,
    }

    struct ScriptedClient {
        script: Script,
        calls: Arc<AtomicUsize>,
        prompts: Arc<Mutex<Vec<String>>>,
        gate: Option<Arc<Notify>>,
    }

    impl GenerationClient for ScriptedClient {
        async fn generate(
            &self,
            prompt: &str,
            _model: &str,
            timeout: Duration,
        ) -> Result<String, GenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            match self.script.clone() {
                Script::Reply(text) => Ok(text.to_string()),
                Script::Timeout => Err(GenError::Timeout(timeout)),
                Script::Status(code) => Err(GenError::Status(code)),
                Script::Panic => panic!("model backend exploded"),
            }
        }
    }

    #[derive(Clone, Default)]
    struct FakeArming {
        armed: Arc<AtomicUsize>,
        disarmed: Arc<AtomicUsize>,
        unavailable: bool,
    }

    impl SelectionArming for FakeArming {
        fn arm_once(&self) -> bool {
            if self.unavailable {
                return false;
            }
            self.armed.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn disarm(&self) {
            self.disarmed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        handle: ControllerHandle,
        ui_loop: UiLoop,
        presenter: RecordingPresenter,
        desktop: SharedDesktop,
        arming: FakeArming,
        calls: Arc<AtomicUsize>,
        prompts: Arc<Mutex<Vec<String>>>,
        gate: Arc<Notify>,
    }

    fn harness(selection: Option<&str>, script: Script, gated: bool) -> Harness {
        harness_with_arming(selection, script, gated, FakeArming::default())
    }

    fn harness_with_arming(
        selection: Option<&str>,
        script: Script,
        gated: bool,
        arming: FakeArming,
    ) -> Harness {
        let desktop = desktop("hello world", selection);
        let presenter = RecordingPresenter::default();
        let (dispatcher, ui_loop) = ui::channel(Box::new(presenter.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());
        let client = ScriptedClient {
            script,
            calls: Arc::clone(&calls),
            prompts: Arc::clone(&prompts),
            gate: gated.then(|| Arc::clone(&gate)),
        };
        let settings = ControllerSettings {
            selection_delay: Duration::ZERO,
            request_timeout: Duration::from_millis(100),
            clipboard: instant_timing(),
            ..ControllerSettings::default()
        };

        let (handle, _task) = spawn(
            PromptRegistry::with_defaults(),
            bridge(&desktop),
            client,
            arming.clone(),
            dispatcher,
            settings,
        );

        Harness {
            handle,
            ui_loop,
            presenter,
            desktop,
            arming,
            calls,
            prompts,
            gate,
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ControllerState>, target: ControllerState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == target))
            .await
            .expect("timed out waiting for controller state")
            .expect("controller stopped");
    }

    /// Triggers and waits until the controller has left and re-entered Idle.
    async fn run_cycle(h: &mut Harness, prompt: &str) {
        let mut rx = h.handle.subscribe_state();
        rx.borrow_and_update();
        assert!(h.handle.trigger(prompt, TriggerStyle::Immediate));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                rx.changed().await.expect("controller stopped");
                if *rx.borrow_and_update() == ControllerState::Idle {
                    break;
                }
            }
        })
        .await
        .expect("cycle did not finish");
        h.ui_loop.run_pending();
    }

    fn clipboard_text(desktop: &SharedDesktop) -> Option<String> {
        match &desktop.lock().unwrap().clipboard {
            ClipboardSnapshot::Text(text) => Some(text.clone()),
            _ => None,
        }
    }

    #[test]
    fn only_documented_transitions_are_legal() {
        use ControllerState::*;
        let all = [Idle, AwaitingSelection, Processing];
        let legal = [
            (Idle, AwaitingSelection),
            (AwaitingSelection, Processing),
            (AwaitingSelection, Idle),
            (Processing, Idle),
        ];
        for from in all {
            for to in all {
                assert_eq!(from.allows(to), legal.contains(&(from, to)), "{from:?} -> {to:?}");
            }
        }
        assert!(Idle.affordance_enabled());
        assert!(!Processing.affordance_enabled());
    }

    #[tokio::test]
    async fn fixes_typo_and_restores_clipboard() {
        let mut h = harness(Some("fix this typo"), Script::Reply("Fixed this typo."), false);
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        assert_eq!(h.desktop.lock().unwrap().pasted, vec!["Fixed this typo."]);
        assert_eq!(clipboard_text(&h.desktop).as_deref(), Some("hello world"));
        assert!(h.prompts.lock().unwrap()[0].contains("fix this typo"));
        assert!(h.presenter.errors().is_empty());
        assert_eq!(h.presenter.affordance(), Some(true));
        assert_eq!(h.handle.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn timeout_reports_one_error_and_pastes_nothing() {
        let mut h = harness(Some("fix this typo"), Script::Timeout, false);
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        assert_eq!(h.presenter.errors().len(), 1);
        assert!(h.presenter.errors()[0].contains("timed out"));
        assert!(h.desktop.lock().unwrap().pasted.is_empty());
        assert_eq!(clipboard_text(&h.desktop).as_deref(), Some("hello world"));
        assert_eq!(h.presenter.affordance(), Some(true));
    }

    #[tokio::test]
    async fn status_error_is_surfaced() {
        let mut h = harness(Some("text"), Script::Status(500), false);
        run_cycle(&mut h, "Summarize").await;

        assert_eq!(h.presenter.errors().len(), 1);
        assert!(h.presenter.errors()[0].contains("500"));
        assert!(h.desktop.lock().unwrap().pasted.is_empty());
    }

    #[tokio::test]
    async fn empty_selection_returns_to_idle_silently() {
        let mut h = harness(None, Script::Reply("unused"), false);
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.presenter.errors().is_empty());
        assert_eq!(h.presenter.affordance(), Some(true));
        assert_eq!(clipboard_text(&h.desktop).as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn reasoning_only_output_is_malformed() {
        let mut h = harness(Some("text"), Script::Reply("<think>hmm</think>   "), false);
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        let errors = h.presenter.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("model returned no text"));
        assert!(h.desktop.lock().unwrap().pasted.is_empty());
    }

    #[tokio::test]
    async fn worker_panic_still_ends_idle() {
        let mut h = harness(Some("text"), Script::Panic, false);
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        assert_eq!(h.presenter.errors().len(), 1);
        assert_eq!(h.presenter.affordance(), Some(true));
        assert_eq!(h.handle.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn unknown_prompt_stays_idle_with_error() {
        let mut h = harness(Some("text"), Script::Reply("x"), false);
        assert!(h.handle.trigger("No such prompt", TriggerStyle::Immediate));
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.ui_loop.run_pending();

        assert_eq!(h.handle.state(), ControllerState::Idle);
        assert_eq!(h.presenter.errors().len(), 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.desktop.lock().unwrap().copies, 0);
    }

    #[tokio::test]
    async fn triggers_while_busy_are_dropped() {
        let mut h = harness(Some("fix this typo"), Script::Reply("Fixed."), true);
        let mut rx = h.handle.subscribe_state();

        assert!(h.handle.trigger(DEFAULT_PROMPT, TriggerStyle::Immediate));
        wait_for_state(&mut rx, ControllerState::Processing).await;

        for _ in 0..3 {
            h.handle.trigger(DEFAULT_PROMPT, TriggerStyle::Immediate);
        }
        h.handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.handle.state(), ControllerState::Processing);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        h.gate.notify_one();
        wait_for_state(&mut rx, ControllerState::Idle).await;
        h.ui_loop.run_pending();

        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.desktop.lock().unwrap().pasted, vec!["Fixed."]);
        assert_eq!(h.desktop.lock().unwrap().copies, 1);
    }

    #[tokio::test]
    async fn armed_trigger_waits_for_selection() {
        let mut h = harness(Some("fix this typo"), Script::Reply("Fixed this typo."), false);
        let mut rx = h.handle.subscribe_state();

        assert!(h.handle.trigger(DEFAULT_PROMPT, TriggerStyle::Armed));
        wait_for_state(&mut rx, ControllerState::AwaitingSelection).await;
        assert_eq!(h.arming.armed.load(Ordering::SeqCst), 1);
        assert_eq!(h.desktop.lock().unwrap().copies, 0);

        h.handle.selection(SelectionEvent {
            x: 100,
            y: 200,
            timestamp: Instant::now(),
        });
        wait_for_state(&mut rx, ControllerState::Idle).await;
        h.ui_loop.run_pending();

        assert_eq!(h.desktop.lock().unwrap().pasted, vec!["Fixed this typo."]);
        assert_eq!(h.presenter.affordance(), Some(true));
    }

    #[tokio::test]
    async fn cancel_disarms_before_capture() {
        let mut h = harness(Some("text"), Script::Reply("x"), false);
        let mut rx = h.handle.subscribe_state();

        assert!(h.handle.trigger(DEFAULT_PROMPT, TriggerStyle::Armed));
        wait_for_state(&mut rx, ControllerState::AwaitingSelection).await;
        assert!(h.handle.cancel());
        wait_for_state(&mut rx, ControllerState::Idle).await;
        h.ui_loop.run_pending();

        assert_eq!(h.arming.disarmed.load(Ordering::SeqCst), 1);
        assert_eq!(h.desktop.lock().unwrap().copies, 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.presenter.affordance(), Some(true));
    }

    #[tokio::test]
    async fn selection_without_armed_cycle_is_ignored() {
        let h = harness(Some("text"), Script::Reply("x"), false);
        h.handle.selection(SelectionEvent {
            x: 0,
            y: 0,
            timestamp: Instant::now(),
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(h.handle.state(), ControllerState::Idle);
        assert_eq!(h.desktop.lock().unwrap().copies, 0);
    }

    #[tokio::test]
    async fn armed_trigger_without_watcher_fails_back_to_idle() {
        let arming = FakeArming {
            unavailable: true,
            ..FakeArming::default()
        };
        let mut h = harness_with_arming(Some("text"), Script::Reply("x"), false, arming);
        let mut rx = h.handle.subscribe_state();
        rx.borrow_and_update();

        assert!(h.handle.trigger(DEFAULT_PROMPT, TriggerStyle::Armed));
        rx.changed().await.expect("controller running");
        wait_for_state(&mut rx, ControllerState::Idle).await;
        h.ui_loop.run_pending();

        let errors = h.presenter.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Selection watcher unavailable"));
        assert_eq!(h.presenter.affordance(), Some(true));
        assert_eq!(h.desktop.lock().unwrap().copies, 0);

        // The next trigger is accepted again.
        run_cycle(&mut h, DEFAULT_PROMPT).await;
        assert_eq!(h.desktop.lock().unwrap().pasted, vec!["x"]);
    }

    #[tokio::test]
    async fn second_shortcut_press_cancels_pending_armed_cycle() {
        let mut h = harness(Some("text"), Script::Reply("x"), false);
        let mut rx = h.handle.subscribe_state();

        assert!(h.handle.shortcut(DEFAULT_PROMPT, TriggerStyle::Armed));
        wait_for_state(&mut rx, ControllerState::AwaitingSelection).await;
        assert!(h.handle.shortcut(DEFAULT_PROMPT, TriggerStyle::Armed));
        wait_for_state(&mut rx, ControllerState::Idle).await;
        h.ui_loop.run_pending();

        assert_eq!(h.arming.armed.load(Ordering::SeqCst), 1);
        assert_eq!(h.arming.disarmed.load(Ordering::SeqCst), 1);
        assert_eq!(h.desktop.lock().unwrap().copies, 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.presenter.affordance(), Some(true));
        assert!(h.presenter.errors().is_empty());
    }

    #[tokio::test]
    async fn shortcut_while_processing_is_dropped() {
        let mut h = harness(Some("fix this typo"), Script::Reply("Fixed."), true);
        let mut rx = h.handle.subscribe_state();

        assert!(h.handle.shortcut(DEFAULT_PROMPT, TriggerStyle::Immediate));
        wait_for_state(&mut rx, ControllerState::Processing).await;
        h.handle.shortcut(DEFAULT_PROMPT, TriggerStyle::Immediate);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.handle.state(), ControllerState::Processing);

        h.gate.notify_one();
        wait_for_state(&mut rx, ControllerState::Idle).await;
        h.ui_loop.run_pending();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.desktop.lock().unwrap().pasted, vec!["Fixed."]);
    }

    #[tokio::test]
    async fn paste_failure_reports_once_and_ends_idle() {
        let mut h = harness(Some("fix this typo"), Script::Reply("Fixed this typo."), false);
        h.desktop.lock().unwrap().fail_paste = true;
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        let errors = h.presenter.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("synthetic keystroke failed during inject"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.desktop.lock().unwrap().pasted.is_empty());
        assert_eq!(clipboard_text(&h.desktop).as_deref(), Some("hello world"));
        assert_eq!(h.presenter.affordance(), Some(true));
        assert_eq!(h.handle.state(), ControllerState::Idle);
    }

    #[tokio::test]
    async fn capture_restore_failure_is_shown_and_cycle_completes() {
        let mut h = harness(Some("fix this typo"), Script::Reply("Fixed this typo."), false);
        h.desktop.lock().unwrap().fail_restore = true;
        run_cycle(&mut h, DEFAULT_PROMPT).await;

        let errors = h.presenter.errors();
        assert!(errors[0].contains("could not restore the clipboard after capture"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.prompts.lock().unwrap()[0].contains("fix this typo"));
        assert_eq!(h.desktop.lock().unwrap().pasted, vec!["Fixed this typo."]);
        assert_eq!(h.presenter.affordance(), Some(true));
        assert_eq!(h.handle.state(), ControllerState::Idle);
    }
}
