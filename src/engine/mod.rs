pub mod generator;
pub mod invocation;
pub mod process;
pub mod tail;

use crate::error::SupervisorError;
use crate::model::{Phase, RunOutcome, StatusEvent};
use crate::protocol::parse_status_line;
use invocation::{LaunchPlan, RunKind};
use process::{ExitReport, OutputLine, ProcessSupervisor, Stream};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tail::LogTailer;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Kill the child process. The run still waits for the OS to report the exit.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tail_interval: Duration,
    pub start_timeout: Duration,
    /// How long to keep reading buffered output after the process exited.
    pub drain_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tail_interval: Duration::from_millis(500),
            start_timeout: process::DEFAULT_START_TIMEOUT,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Result of one run, turned into the terminal `Finished` event by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Overrides the outcome's default message.
    pub message: Option<String>,
}

impl RunReport {
    fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            message: None,
        }
    }

    pub fn into_event(self) -> StatusEvent {
        StatusEvent::finished(self.outcome, self.message)
    }
}

/// Classify an exit. A requested cancellation wins over how the process ended.
pub fn classify(exit: ExitReport, cancelled: bool) -> RunOutcome {
    if cancelled {
        RunOutcome::Cancelled
    } else if exit.crashed {
        RunOutcome::Crashed
    } else {
        match exit.code {
            Some(0) => RunOutcome::Succeeded,
            Some(code) => RunOutcome::Failed { code },
            None => RunOutcome::Crashed,
        }
    }
}

/// Turns raw output lines into events for one run.
///
/// Structured events are suppressed once cancellation was requested, and a stage can
/// complete only once; suppressed lines are still passed on as log text.
pub struct LineInterpreter {
    kind: RunKind,
    cancel: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<StatusEvent>,
    completed_stages: HashSet<u32>,
    generated: usize,
}

impl LineInterpreter {
    pub fn new(
        kind: RunKind,
        cancel: Arc<AtomicBool>,
        event_tx: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            kind,
            cancel,
            event_tx,
            completed_stages: HashSet::new(),
            generated: 0,
        }
    }

    fn send(&self, event: StatusEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn process_output(&mut self, line: OutputLine) {
        match (self.kind, line.stream) {
            (RunKind::Generate { .. }, _) => self.generator_line(&line.text),
            (RunKind::Solve, Stream::Stdout) => self.status_line(&line.text),
            (RunKind::Solve, Stream::Stderr) => {
                let text = line.text.trim();
                if !text.is_empty() {
                    self.send(StatusEvent::log(format!("[stderr] {text}")));
                }
            }
        }
    }

    pub fn log_file_line(&mut self, line: &str) {
        match self.kind {
            RunKind::Solve => self.status_line(line),
            RunKind::Generate { .. } => self.generator_line(line),
        }
    }

    fn status_line(&mut self, line: &str) {
        let Some(event) = parse_status_line(line) else {
            return;
        };
        let keep = match &event {
            StatusEvent::LogLine { .. } => true,
            _ if self.cancel.load(Ordering::Relaxed) => false,
            StatusEvent::StageCompleted { stage, .. } => self.completed_stages.insert(*stage),
            _ => true,
        };
        if keep {
            self.send(event);
        } else {
            self.send(StatusEvent::log(line.trim()));
        }
    }

    fn generator_line(&mut self, line: &str) {
        let clean = generator::strip_ansi(line);
        let text = clean.trim();
        if text.is_empty() {
            return;
        }
        self.send(StatusEvent::log(text));
        if let Some(path) = generator::find_generated_csv(text) {
            self.generated += 1;
            self.send(StatusEvent::InstanceGenerated {
                index: self.generated,
                path: path.to_string(),
            });
        }
    }

    fn finish(&self, outcome: RunOutcome) -> RunReport {
        let message = match (self.kind, &outcome) {
            (RunKind::Generate { .. }, RunOutcome::Succeeded) => {
                Some(format!("Generated {} instance(s)", self.generated))
            }
            _ => None,
        };
        RunReport { outcome, message }
    }
}

/// Runs one [`LaunchPlan`] from executable lookup to exit classification.
pub struct RunEngine {
    plan: LaunchPlan,
    settings: EngineSettings,
}

impl RunEngine {
    pub fn new(plan: LaunchPlan, settings: EngineSettings) -> Self {
        Self { plan, settings }
    }

    /// Drive the run to completion, sending every event except the terminal one.
    ///
    /// `on_phase` is told when the child is observed alive and when it has exited.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<StatusEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
        cancel: Arc<AtomicBool>,
        on_phase: impl Fn(Phase) + Send,
    ) -> RunReport {
        let RunEngine { plan, settings } = self;
        let send = |event: StatusEvent| {
            let _ = event_tx.send(event);
        };

        let exe = match process::resolve_executable(&plan.candidates) {
            Ok(exe) => exe,
            Err(e) => {
                tracing::warn!("{e}");
                return RunReport::new(RunOutcome::ExecutableNotFound);
            }
        };

        send(StatusEvent::log(format!("Executable: {}", exe.display())));
        if let RunKind::Generate { count } = plan.kind {
            send(StatusEvent::GenerationStarted { count });
        }
        for line in &plan.prelude {
            send(StatusEvent::log(line.as_str()));
        }

        if let Err(e) = prepare(&plan) {
            tracing::warn!("failed to prepare run: {e}");
            return RunReport::new(RunOutcome::StartFailed {
                reason: e.to_string(),
            });
        }

        if cancel.load(Ordering::Relaxed) {
            return RunReport::new(RunOutcome::Cancelled);
        }

        let working_dir = plan
            .working_dir
            .clone()
            .unwrap_or_else(|| default_working_dir(plan.kind, &exe));
        let supervisor = ProcessSupervisor::with_start_timeout(settings.start_timeout);
        let (mut handle, mut lines) = match supervisor.start(&exe, &plan.args, &working_dir).await
        {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!("{e}");
                return RunReport::new(start_outcome(e));
            }
        };

        send(StatusEvent::log(format!(
            "Process started (pid {})",
            handle.pid()
        )));
        on_phase(Phase::Running);
        // A cancel that arrived while we were still starting.
        if cancel.load(Ordering::Relaxed) {
            handle.request_cancel();
        }

        let mut interp = LineInterpreter::new(plan.kind, cancel.clone(), event_tx.clone());
        let mut tailer = plan.log_path.clone().map(LogTailer::open);
        let mut tick = tailer.as_ref().map(|_| {
            let mut t = tokio::time::interval(settings.tail_interval);
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        });
        let mut lines_open = true;
        let mut control_open = true;

        let status = loop {
            tokio::select! {
                line = lines.recv(), if lines_open => match line {
                    Some(line) => interp.process_output(line),
                    None => lines_open = false,
                },
                _ = async {
                    match tick.as_mut() {
                        Some(t) => {
                            t.tick().await;
                        }
                        None => futures::future::pending::<()>().await,
                    }
                } => {
                    if let Some(tailer) = tailer.as_mut() {
                        for line in tailer.poll_new_lines() {
                            interp.log_file_line(&line);
                        }
                    }
                }
                msg = control_rx.recv(), if control_open => match msg {
                    Some(EngineControl::Cancel) => {
                        handle.request_cancel();
                    }
                    None => control_open = false,
                },
                status = handle.wait() => break status,
            }
        };

        on_phase(Phase::Draining);
        let exit = status.unwrap_or_else(|e| {
            tracing::warn!(pid = handle.pid(), "wait failed: {e}");
            ExitReport {
                code: None,
                crashed: true,
            }
        });

        // Output still buffered in the pipes belongs to this run.
        if lines_open {
            let drained = tokio::time::timeout(settings.drain_timeout, async {
                while let Some(line) = lines.recv().await {
                    interp.process_output(line);
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!("output still open after exit, giving up");
            }
        }
        if let Some(tailer) = tailer.as_mut() {
            for line in tailer.drain() {
                interp.log_file_line(&line);
            }
            tracing::debug!(offset = tailer.offset(), "log drained");
        }

        let outcome = classify(exit, cancel.load(Ordering::Relaxed));
        tracing::info!(pid = handle.pid(), code = ?exit.code, ?outcome, "run finished");
        interp.finish(outcome)
    }
}

/// The solver runs next to its executable; the generator from its project root.
fn default_working_dir(kind: RunKind, exe: &Path) -> PathBuf {
    match kind {
        RunKind::Generate { .. } => generator::project_root(exe),
        RunKind::Solve => match exe.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        },
    }
}

fn prepare(plan: &LaunchPlan) -> std::io::Result<()> {
    for dir in &plan.create_dirs {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(file) = &plan.prepare {
        std::fs::write(&file.path, &file.contents)?;
    }
    Ok(())
}

fn start_outcome(err: SupervisorError) -> RunOutcome {
    match err {
        SupervisorError::NotFound { .. } => RunOutcome::ExecutableNotFound,
        SupervisorError::StartTimeout(limit) => RunOutcome::StartFailed {
            reason: format!(
                "process did not start within {}",
                humantime::format_duration(limit)
            ),
        },
        SupervisorError::StartFailed { source, .. } => RunOutcome::StartFailed {
            reason: source.to_string(),
        },
        SupervisorError::Io(e) => RunOutcome::StartFailed {
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreter(
        kind: RunKind,
    ) -> (
        LineInterpreter,
        Arc<AtomicBool>,
        mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        (LineInterpreter::new(kind, cancel.clone(), tx), cancel, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn stdout(text: &str) -> OutputLine {
        OutputLine {
            stream: Stream::Stdout,
            text: text.into(),
        }
    }

    #[test]
    fn classification_order() {
        let exit = |code, crashed| ExitReport { code, crashed };
        assert_eq!(classify(exit(Some(0), false), false), RunOutcome::Succeeded);
        assert_eq!(
            classify(exit(Some(2), false), false),
            RunOutcome::Failed { code: 2 }
        );
        assert_eq!(classify(exit(None, true), false), RunOutcome::Crashed);
        assert_eq!(classify(exit(None, true), true), RunOutcome::Cancelled);
        assert_eq!(classify(exit(Some(0), false), true), RunOutcome::Cancelled);
    }

    #[test]
    fn start_timeout_reports_start_failure() {
        let outcome = start_outcome(SupervisorError::StartTimeout(Duration::from_secs(5)));
        assert_eq!(
            outcome,
            RunOutcome::StartFailed {
                reason: "process did not start within 5s".into()
            }
        );
        let event = RunReport::new(outcome).into_event();
        assert_eq!(
            event,
            StatusEvent::Finished {
                success: false,
                message: "failed to start: process did not start within 5s".into(),
                outcome: RunOutcome::StartFailed {
                    reason: "process did not start within 5s".into()
                },
            }
        );
    }

    #[test]
    fn working_dir_depends_on_run_kind() {
        let exe = Path::new("/src/gen/build/release/bin/OrderGenCap");
        assert_eq!(
            default_working_dir(RunKind::Generate { count: 1 }, exe),
            Path::new("/src/gen")
        );
        assert_eq!(
            default_working_dir(RunKind::Solve, exe),
            Path::new("/src/gen/build/release/bin")
        );
        assert_eq!(
            default_working_dir(RunKind::Solve, Path::new("solver")),
            Path::new(".")
        );
    }

    #[test]
    fn stage_completes_once() {
        let (mut interp, _, mut rx) = interpreter(RunKind::Solve);
        interp.process_output(stdout("[STAGE:1:START]"));
        interp.process_output(stdout("[STAGE:1:DONE:10:1:0]"));
        interp.process_output(stdout("[STAGE:1:DONE:9:1:0]"));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], StatusEvent::StageCompleted { stage: 1, .. }));
        assert_eq!(events[2], StatusEvent::log("[STAGE:1:DONE:9:1:0]"));
    }

    #[test]
    fn no_structured_events_after_cancel() {
        let (mut interp, cancel, mut rx) = interpreter(RunKind::Solve);
        interp.process_output(stdout("[STAGE:2:START]"));
        cancel.store(true, Ordering::Relaxed);
        interp.process_output(stdout("[STAGE:2:DONE:1.5:2.5:0.1]"));
        interp.log_file_line("[ERROR:late]");
        interp.process_output(stdout("still going"));
        let events = drain(&mut rx);
        assert!(events[1..]
            .iter()
            .all(|e| matches!(e, StatusEvent::LogLine { .. })));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn stderr_is_prefixed_and_not_parsed() {
        let (mut interp, _, mut rx) = interpreter(RunKind::Solve);
        interp.process_output(OutputLine {
            stream: Stream::Stderr,
            text: "[DONE:SUCCESS] ".into(),
        });
        interp.process_output(OutputLine {
            stream: Stream::Stderr,
            text: "   ".into(),
        });
        assert_eq!(
            drain(&mut rx),
            [StatusEvent::log("[stderr] [DONE:SUCCESS]")]
        );
    }

    #[test]
    fn generator_output_counts_instances() {
        let (mut interp, _, mut rx) = interpreter(RunKind::Generate { count: 2 });
        interp.process_output(stdout("\u{1b}[32mSaved data/a.csv\u{1b}[0m"));
        interp.process_output(OutputLine {
            stream: Stream::Stderr,
            text: "Saved data/b.csv".into(),
        });
        let events = drain(&mut rx);
        assert_eq!(events[0], StatusEvent::log("Saved data/a.csv"));
        assert_eq!(
            events[3],
            StatusEvent::InstanceGenerated {
                index: 2,
                path: "data/b.csv".into()
            }
        );
        let report = interp.finish(RunOutcome::Succeeded);
        assert_eq!(report.message.as_deref(), Some("Generated 2 instance(s)"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        async fn run_script(
            dir: &Path,
            body: &str,
            log_path: Option<PathBuf>,
        ) -> (RunReport, Vec<StatusEvent>) {
            let script = dir.join("solver.sh");
            std::fs::write(&script, body).unwrap();
            let plan = LaunchPlan {
                kind: RunKind::Solve,
                candidates: vec![PathBuf::from("/bin/sh")],
                args: vec![script.display().to_string()],
                working_dir: Some(dir.to_path_buf()),
                log_path,
                create_dirs: vec![dir.join("out")],
                prepare: None,
                prelude: vec!["Algorithm: RF".into()],
            };
            let settings = EngineSettings {
                tail_interval: Duration::from_millis(20),
                ..EngineSettings::default()
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
            let report = RunEngine::new(plan, settings)
                .run(tx, ctrl_rx, Arc::new(AtomicBool::new(false)), |_| {})
                .await;
            let mut events = Vec::new();
            while let Some(ev) = rx.recv().await {
                events.push(ev);
            }
            (report, events)
        }

        #[tokio::test]
        async fn exit_code_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let body = "echo '[LOAD:OK:150:30:5:3]'\nexit 2\n";
            let (report, events) = run_script(dir.path(), body, None).await;
            assert_eq!(report.outcome, RunOutcome::Failed { code: 2 });
            assert!(report.into_event().to_message().contains('2'));
            assert!(events.contains(&StatusEvent::DataLoaded {
                items: 150,
                periods: 30,
                flows: 5,
                groups: 3
            }));
            assert!(dir.path().join("out").is_dir());
        }

        #[tokio::test]
        async fn log_file_is_tailed_to_the_end() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("run.log");
            let body = format!(
                "printf 'iter 1\\n' >> '{log}'\nsleep 0.1\nprintf 'iter 2\\nlast' >> '{log}'\necho '[DONE:SUCCESS]'\n",
                log = log.display()
            );
            let (report, events) = run_script(dir.path(), &body, Some(log)).await;
            assert_eq!(report.outcome, RunOutcome::Succeeded);
            let texts: Vec<String> = events
                .iter()
                .filter_map(|e| match e {
                    StatusEvent::LogLine { text } if text.starts_with("iter") || text == "last" => {
                        Some(text.clone())
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(texts, ["iter 1", "iter 2", "last"]);
            assert!(events.contains(&StatusEvent::DoneReported));
        }

        #[tokio::test]
        async fn missing_executable_spawns_nothing() {
            let dir = tempfile::tempdir().unwrap();
            let plan = LaunchPlan {
                kind: RunKind::Solve,
                candidates: vec![dir.path().join("absent")],
                args: vec![],
                working_dir: None,
                log_path: None,
                create_dirs: vec![dir.path().join("never")],
                prepare: None,
                prelude: vec![],
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
            let report = RunEngine::new(plan, EngineSettings::default())
                .run(tx, ctrl_rx, Arc::new(AtomicBool::new(false)), |phase| {
                    panic!("unexpected phase {phase:?}")
                })
                .await;
            assert_eq!(report.outcome, RunOutcome::ExecutableNotFound);
            assert!(rx.recv().await.is_none());
            assert!(!dir.path().join("never").exists());
        }
    }
}
