//! Run lifecycle controller.
//!
//! Enforces one run at a time, owns the per-run worker task and publishes every run's
//! events, in order, on a single channel for presentation layers.

use crate::engine::invocation::{self, LaunchPlan};
use crate::engine::{EngineControl, EngineSettings, RunEngine, RunReport};
use crate::error::ControllerError;
use crate::model::{GeneratorConfig, Phase, RunConfig, RunOutcome, StatusEvent};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub engine: EngineSettings,
    pub solver_candidates: Vec<PathBuf>,
    pub generator_candidates: Vec<PathBuf>,
}

/// What the UI asks the controller to run.
#[derive(Debug, Clone)]
pub enum Job {
    Solve(RunConfig),
    Generate(GeneratorConfig),
}

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start,
    Cancel,
    Quit,
}

/// Handle for the active run.
#[derive(Debug, Clone)]
struct RunCtx {
    run_id: u64,
    cancel: Arc<AtomicBool>,
    ctrl_tx: UnboundedSender<EngineControl>,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Starting(RunCtx),
    Running(RunCtx),
    Draining(RunCtx),
}

impl Slot {
    fn phase(&self) -> Phase {
        match self {
            Slot::Idle => Phase::Idle,
            Slot::Starting(_) => Phase::Starting,
            Slot::Running(_) => Phase::Running,
            Slot::Draining(_) => Phase::Draining,
        }
    }

    fn ctx(&self) -> Option<&RunCtx> {
        match self {
            Slot::Idle => None,
            Slot::Starting(ctx) | Slot::Running(ctx) | Slot::Draining(ctx) => Some(ctx),
        }
    }
}

struct Shared {
    slot: Mutex<Slot>,
    event_tx: UnboundedSender<StatusEvent>,
    next_id: AtomicU64,
    settings: ControllerSettings,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-flight run orchestrator. Cheap to clone; all clones share one slot.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// Create a controller and the receiver its events are published on.
    pub fn new(settings: ControllerSettings) -> (Self, UnboundedReceiver<StatusEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            slot: Mutex::new(Slot::Idle),
            event_tx,
            next_id: AtomicU64::new(1),
            settings,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            event_rx,
        )
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase()
    }

    /// Start the solver. Must be called from within a tokio runtime.
    pub fn start(&self, cfg: RunConfig) -> Result<u64, ControllerError> {
        let candidates = self.shared.settings.solver_candidates.clone();
        self.launch(LaunchPlan::solve(&cfg, candidates, invocation::now()))
    }

    /// Start the instance generator. Must be called from within a tokio runtime.
    pub fn start_generation(&self, cfg: GeneratorConfig) -> Result<u64, ControllerError> {
        let candidates = self.shared.settings.generator_candidates.clone();
        self.launch(LaunchPlan::generate(&cfg, candidates))
    }

    pub fn start_job(&self, job: &Job) -> Result<u64, ControllerError> {
        match job {
            Job::Solve(cfg) => self.start(cfg.clone()),
            Job::Generate(cfg) => self.start_generation(cfg.clone()),
        }
    }

    /// Run `plan` on a fresh worker task. Rejected while another run is active.
    pub fn launch(&self, plan: LaunchPlan) -> Result<u64, ControllerError> {
        let (ctx, ctrl_rx) = {
            let mut slot = self.shared.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(ControllerError::Busy);
            }
            let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
            let ctx = RunCtx {
                run_id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
                cancel: Arc::new(AtomicBool::new(false)),
                ctrl_tx,
            };
            *slot = Slot::Starting(ctx.clone());
            (ctx, ctrl_rx)
        };

        let run_id = ctx.run_id;
        tracing::info!(run_id, kind = ?plan.kind, "run starting");

        let sink = RunSink {
            shared: self.shared.clone(),
            run_id,
            done: false,
        };
        let engine = RunEngine::new(plan, self.shared.settings.engine.clone());
        let event_tx = self.shared.event_tx.clone();
        tokio::spawn(async move {
            let report = engine
                .run(event_tx, ctrl_rx, ctx.cancel, |phase| sink.set_phase(phase))
                .await;
            sink.finish(report);
        });
        Ok(run_id)
    }

    /// Ask the active run to stop. Returns whether a run was starting or running.
    ///
    /// Publishes nothing itself; the run's own `Finished` reports the cancellation.
    pub fn request_cancel(&self) -> bool {
        let slot = self.shared.lock();
        match &*slot {
            Slot::Starting(ctx) | Slot::Running(ctx) => {
                if !ctx.cancel.swap(true, Ordering::Relaxed) {
                    tracing::info!(run_id = ctx.run_id, "cancel requested");
                    let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                }
                true
            }
            Slot::Idle | Slot::Draining(_) => false,
        }
    }

    /// Publish an informational line on behalf of the active run. Dropped when idle.
    pub fn notice(&self, text: impl Into<String>) {
        let slot = self.shared.lock();
        if slot.ctx().is_some() {
            let _ = self.shared.event_tx.send(StatusEvent::log(text));
        }
    }
}

/// The worker's link back to the controller.
///
/// Dropping it without calling `finish` (the worker panicked or was torn down) still
/// publishes `Finished` and frees the slot.
struct RunSink {
    shared: Arc<Shared>,
    run_id: u64,
    done: bool,
}

impl RunSink {
    fn set_phase(&self, phase: Phase) {
        let mut slot = self.shared.lock();
        let Some(ctx) = slot.ctx().filter(|c| c.run_id == self.run_id).cloned() else {
            return;
        };
        *slot = match phase {
            Phase::Running => Slot::Running(ctx),
            Phase::Draining => Slot::Draining(ctx),
            Phase::Starting => Slot::Starting(ctx),
            Phase::Idle => Slot::Idle,
        };
    }

    fn finish(mut self, report: RunReport) {
        self.complete(report.into_event());
    }

    fn complete(&mut self, event: StatusEvent) {
        if self.done {
            return;
        }
        self.done = true;
        // Free the slot and publish under one lock so a consumer that sees `Finished`
        // can start the next run immediately.
        let mut slot = self.shared.lock();
        if slot.ctx().is_some_and(|c| c.run_id == self.run_id) {
            *slot = Slot::Idle;
        }
        tracing::info!(run_id = self.run_id, "run finished");
        let _ = self.shared.event_tx.send(event);
    }
}

impl Drop for RunSink {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(run_id = self.run_id, "worker stopped without reporting");
            self.complete(StatusEvent::finished(RunOutcome::Aborted, None));
        }
    }
}

/// Drive the controller from UI commands until the user quits.
///
/// Quit cancels an active run and waits for it to finish so the consumer sees its
/// terminal event.
pub(crate) async fn run_controller(
    controller: Controller,
    job: Job,
    start_on_launch: bool,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) {
    if start_on_launch {
        start_logged(&controller, &job);
    }
    let mut quit_pending = false;
    // Cancel watchdog: if a cancel takes too long, keep the user informed.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::Start) => start_logged(&controller, &job),
                    Some(UiCommand::Cancel) => {
                        if controller.request_cancel() {
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        quit_pending = true;
                        controller.request_cancel();
                    }
                }
            }
            _ = watchdog.tick() => {
                let idle = controller.phase() == Phase::Idle;
                if quit_pending && idle {
                    break;
                }
                if idle {
                    cancel_deadline = None;
                } else if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        controller.notice("Still cancelling…");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}

fn start_logged(controller: &Controller, job: &Job) {
    if let Err(e) = controller.start_job(job) {
        tracing::debug!("start ignored: {e}");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::invocation::RunKind;
    use std::path::Path;

    fn shell_plan(dir: &Path, body: &str) -> LaunchPlan {
        let script = dir.join("solver.sh");
        std::fs::write(&script, body).unwrap();
        LaunchPlan {
            kind: RunKind::Solve,
            candidates: vec![PathBuf::from("/bin/sh")],
            args: vec![script.display().to_string()],
            working_dir: Some(dir.to_path_buf()),
            log_path: None,
            create_dirs: vec![],
            prepare: None,
            prelude: vec![],
        }
    }

    async fn until_finished(rx: &mut UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = ev.is_finished();
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn missing_executable_yields_single_finished() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = Controller::new(ControllerSettings {
            solver_candidates: vec![dir.path().join("LS-NTGF-All")],
            ..ControllerSettings::default()
        });
        let cfg = RunConfig::new(crate::model::Algorithm::Rf, "d.csv", dir.path(), dir.path());
        controller.start(cfg).unwrap();

        let events = until_finished(&mut rx).await;
        assert_eq!(
            events,
            [StatusEvent::finished(RunOutcome::ExecutableNotFound, None)]
        );
        assert_eq!(controller.phase(), Phase::Idle);
        match &events[0] {
            StatusEvent::Finished { success, message, .. } => {
                assert!(!success);
                assert_eq!(message, "executable not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = Controller::new(ControllerSettings::default());
        controller
            .launch(shell_plan(dir.path(), "exec sleep 30\n"))
            .unwrap();
        assert_eq!(
            controller.launch(shell_plan(dir.path(), "exit 0\n")),
            Err(ControllerError::Busy)
        );

        assert!(controller.request_cancel());
        let events = until_finished(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&StatusEvent::finished(RunOutcome::Cancelled, None))
        );

        // Finished is only published once the slot is free again.
        assert_eq!(controller.phase(), Phase::Idle);
        controller.launch(shell_plan(dir.path(), "exit 0\n")).unwrap();
        let events = until_finished(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&StatusEvent::finished(RunOutcome::Succeeded, None))
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = Controller::new(ControllerSettings::default());
        controller
            .launch(shell_plan(dir.path(), "echo '[STAGE:1:START]'\nexec sleep 30\n"))
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                StatusEvent::StageStarted { stage: 1, .. } => break,
                ev => assert!(!ev.is_finished()),
            }
        }
        assert!(controller.request_cancel());
        assert!(controller.request_cancel());

        let events = until_finished(&mut rx).await;
        assert!(events
            .iter()
            .all(|e| !matches!(e, StatusEvent::StageCompleted { .. })));
        match events.last() {
            Some(StatusEvent::Finished {
                success, outcome, message,
            }) => {
                assert!(!success);
                assert_eq!(*outcome, RunOutcome::Cancelled);
                assert!(message.contains("cancelled"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(!controller.request_cancel());
        controller.notice("ignored");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = Controller::new(ControllerSettings::default());
        controller
            .launch(shell_plan(
                dir.path(),
                "echo '[STAGE:1:DONE:12345.6:5.2:0.01]'\necho oops >&2\nexit 2\n",
            ))
            .unwrap();
        let events = until_finished(&mut rx).await;
        assert!(events.contains(&StatusEvent::StageCompleted {
            stage: 1,
            objective: 12345.6,
            runtime_seconds: 5.2,
            gap: 0.01
        }));
        assert!(events.contains(&StatusEvent::log("[stderr] oops")));
        match events.last() {
            Some(StatusEvent::Finished { success, message, .. }) => {
                assert!(!success);
                assert!(message.contains('2'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_worker_still_reports_and_frees_slot() {
        let (controller, mut rx) = Controller::new(ControllerSettings::default());
        let (ctrl_tx, _ctrl_rx) = mpsc::unbounded_channel();
        *controller.shared.lock() = Slot::Running(RunCtx {
            run_id: 7,
            cancel: Arc::new(AtomicBool::new(false)),
            ctrl_tx,
        });
        drop(RunSink {
            shared: controller.shared.clone(),
            run_id: 7,
            done: false,
        });

        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(
            rx.recv().await,
            Some(StatusEvent::finished(RunOutcome::Aborted, None))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn quit_waits_for_the_active_run() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut rx) = Controller::new(ControllerSettings::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let plan_dir = dir.path().to_path_buf();
        controller.launch(shell_plan(&plan_dir, "exec sleep 30\n")).unwrap();

        let job = Job::Generate(GeneratorConfig::default());
        let task = tokio::spawn(run_controller(controller.clone(), job, false, cmd_rx));
        cmd_tx.send(UiCommand::Quit).unwrap();
        task.await.unwrap();

        assert_eq!(controller.phase(), Phase::Idle);
        let events = until_finished(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&StatusEvent::finished(RunOutcome::Cancelled, None))
        );
    }
}
