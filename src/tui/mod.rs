mod help;
mod state;

use crate::model::{Phase, StatusEvent};
use crate::orchestrator::{self, Controller, ControllerSettings, Job, UiCommand};
use crate::summary::MergeInfo;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Tabs},
    Terminal,
};
use state::UiState;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

const TAB_COUNT: usize = 3;

pub async fn run(settings: ControllerSettings, job: Job, start_on_launch: bool) -> Result<bool> {
    let (controller, event_rx) = Controller::new(settings);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let title = job_title(&job);
    let ui_controller = controller.clone();
    let ui_handle = std::thread::spawn(move || {
        run_threaded(title, start_on_launch, ui_controller, event_rx, cmd_tx)
    });

    orchestrator::run_controller(controller, job, start_on_launch, cmd_rx).await;

    match tokio::task::spawn_blocking(move || ui_handle.join()).await {
        Ok(Ok(res)) => res,
        Ok(Err(_)) => Err(anyhow::anyhow!("TUI thread panicked")),
        Err(e) => Err(anyhow::anyhow!("join TUI thread: {e}")),
    }
}

fn job_title(job: &Job) -> String {
    match job {
        Job::Solve(cfg) => {
            let data = cfg
                .data_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| cfg.data_path.display().to_string());
            format!(
                "{} ({}) on {}, limit {}",
                cfg.algorithm.as_flag(),
                cfg.algorithm.describe(),
                data,
                humantime::format_duration(cfg.time_limit)
            )
        }
        Job::Generate(cfg) => format!(
            "Generate {} instance(s) N={} T={} F={} G={} into {}",
            cfg.count,
            cfg.n,
            cfg.t,
            cfg.f,
            cfg.g,
            cfg.output_dir.display()
        ),
    }
}

/// Run the TUI loop on a dedicated thread.
///
/// Returns whether the last run succeeded.
fn run_threaded(
    title: String,
    start_on_launch: bool,
    controller: Controller,
    mut event_rx: UnboundedReceiver<StatusEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<bool> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::new(title);
    if start_on_launch {
        state.reset_run();
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut log_page = 10usize;

    let res = loop {
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }
        state.phase = controller.phase();

        if last_tick.elapsed() >= tick_rate {
            terminal
                .draw(|f| {
                    log_page = f.area().height.saturating_sub(6).max(1) as usize;
                    draw(f.area(), f, &state)
                })
                .ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(state.last_succeeded());
                    }
                    (_, KeyCode::Char('s')) => {
                        if controller.phase() == Phase::Idle {
                            // The slot turns idle only after `Finished` was queued, so this
                            // drain picks up the tail of the previous run.
                            while let Ok(ev) = event_rx.try_recv() {
                                state.apply_event(ev);
                            }
                            state.reset_run();
                            state.info = "Start requested…".into();
                            let _ = cmd_tx.send(UiCommand::Start);
                        } else {
                            state.info = "A run is already active".into();
                        }
                    }
                    (_, KeyCode::Char('c')) => {
                        if controller.phase() == Phase::Idle {
                            state.info = "Nothing to cancel".into();
                        } else {
                            state.info = "Cancelling…".into();
                            let _ = cmd_tx.send(UiCommand::Cancel);
                        }
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % TAB_COUNT;
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) if state.tab == 1 => {
                        state.scroll_up(1);
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) if state.tab == 1 => {
                        state.scroll_down(1);
                    }
                    (_, KeyCode::PageUp) if state.tab == 1 => state.scroll_up(log_page),
                    (_, KeyCode::PageDown) if state.tab == 1 => state.scroll_down(log_page),
                    (_, KeyCode::End) => state.log_scroll = 0,
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("Log"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("solver-panel"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => draw_log(chunks[1], f, state, true),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(6), // Job + status
                Constraint::Min(0),    // Stages/instances left, recent output right
                Constraint::Length(3), // Info line
            ]
            .as_ref(),
        )
        .split(area);

    draw_run_header(main[0], f, state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(main[1]);

    if state.run.expected_instances.is_some() {
        draw_instances(body[0], f, state);
    } else {
        draw_stages(body[0], f, state);
    }
    draw_log(body[1], f, state, false);

    let info = Paragraph::new(state.info.as_str())
        .block(Block::default().borders(Borders::ALL).title("Info"));
    f.render_widget(info, main[2]);
}

fn draw_run_header(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let (status, color) = state.status();
    let elapsed = state
        .elapsed()
        .map(|d| humantime::format_duration(Duration::from_secs(d.as_secs())).to_string())
        .unwrap_or_else(|| "-".into());

    let mut lines = vec![
        Line::from(vec![
            Span::styled("Job: ", Style::default().fg(Color::Gray)),
            Span::raw(state.title.clone()),
        ]),
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::styled(
                status,
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(elapsed),
        ]),
    ];

    let mut data = Vec::new();
    if let Some(d) = &state.run.dataset {
        data.push(Span::styled("Data: ", Style::default().fg(Color::Gray)));
        data.push(Span::raw(format!(
            "{} orders, {} periods, {} flows, {} groups",
            d.items, d.periods, d.flows, d.groups
        )));
    }
    match state.run.merge {
        Some(MergeInfo::Merged { original, merged }) => {
            data.push(Span::styled("   Merge: ", Style::default().fg(Color::Gray)));
            data.push(Span::raw(format!("{original} -> {merged}")));
        }
        Some(MergeInfo::Skipped) => {
            data.push(Span::styled("   Merge: ", Style::default().fg(Color::Gray)));
            data.push(Span::raw("skipped"));
        }
        None => {}
    }
    if !data.is_empty() {
        lines.push(Line::from(data));
    }
    if let Some(err) = state.run.errors.last() {
        lines.push(Line::from(Span::styled(
            format!("Solver error: {err}"),
            Style::default().fg(Color::Red),
        )));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Run"));
    f.render_widget(p, area);
}

fn draw_stages(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let header = Row::new(vec!["Stage", "Objective", "Runtime", "Gap"])
        .style(Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD));

    let running = matches!(state.phase, Phase::Running | Phase::Draining);
    let rows: Vec<Row> = state
        .run
        .stages
        .iter()
        .map(|s| {
            let fmt = |v: Option<f64>, f: fn(f64) -> String| v.map(f).unwrap_or_else(|| "-".into());
            let style = if s.is_done() {
                Style::default().fg(Color::Green)
            } else if running {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default()
            };
            Row::new(vec![
                Cell::from(s.name.clone()),
                Cell::from(fmt(s.objective, |v| format!("{v:.2}"))),
                Cell::from(fmt(s.runtime_seconds, |v| format!("{v:.2}s"))),
                Cell::from(fmt(s.gap, |v| format!("{:.2}%", v * 100.0))),
            ])
            .style(style)
        })
        .collect();

    let title = match state.run.final_objective() {
        Some(obj) => format!("Stages (best {obj:.2})"),
        None => "Stages".to_string(),
    };
    let table = Table::new(
        rows,
        [
            Constraint::Min(16),
            Constraint::Length(14),
            Constraint::Length(10),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, area);
}

fn draw_instances(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let expected = state.run.expected_instances.unwrap_or(0);
    let done = state.run.instances.len() as u32;

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let ratio = if expected == 0 {
        0.0
    } else {
        (f64::from(done) / f64::from(expected)).clamp(0.0, 1.0)
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Instances"))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio)
        .label(format!("{done} / {expected}"));
    f.render_widget(gauge, parts[0]);

    let height = parts[1].height.saturating_sub(2) as usize;
    let skip = state.run.instances.len().saturating_sub(height);
    let lines: Vec<Line> = state
        .run
        .instances
        .iter()
        .skip(skip)
        .map(|p| Line::from(p.as_str()))
        .collect();
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Files"));
    f.render_widget(p, parts[1]);
}

/// Log pane. The dashboard always follows the tail; the log tab honors scrolling.
fn draw_log(area: Rect, f: &mut ratatui::Frame, state: &UiState, scrollable: bool) {
    let height = area.height.saturating_sub(2) as usize;
    let back = if scrollable { state.log_scroll } else { 0 };
    let end = state.log.len().saturating_sub(back);
    let start = end.saturating_sub(height);

    let lines: Vec<Line> = state.log[start..end]
        .iter()
        .map(|e| {
            Line::from(Span::styled(
                e.text.as_str(),
                Style::default().fg(e.kind.color()),
            ))
        })
        .collect();

    let title = if back > 0 {
        format!("Output ({back} lines up, End to follow)")
    } else {
        "Output".to_string()
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}
