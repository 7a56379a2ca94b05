use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(keys: &[&'static str], pad: usize, what: &'static str) -> Line<'static> {
    let mut spans = vec![Span::raw("  ")];
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw(" / "));
        }
        spans.push(Span::styled(*key, Style::default().fg(Color::Magenta)));
    }
    spans.push(Span::raw(" ".repeat(pad)));
    spans.push(Span::raw(what));
    Line::from(spans)
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        key_line(&["q", "Ctrl-C"], 2, "Quit (cancels a running job first)"),
        key_line(&["s"], 12, "Start the job"),
        key_line(&["c"], 12, "Cancel the running job"),
        key_line(&["tab"], 10, "Switch tabs"),
        key_line(&["?"], 12, "Show this help"),
        Line::from(""),
        Line::from("Log tab:"),
        key_line(&["↑/↓", "j/k"], 2, "Scroll"),
        key_line(&["PgUp/PgDn"], 4, "Scroll a page"),
        key_line(&["End"], 10, "Follow new output"),
        Line::from(""),
        Line::from("Logs:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled(
                crate::cli::data_dir()
                    .join("panel.log")
                    .display()
                    .to_string(),
                Style::default().fg(Color::Cyan),
            ),
        ]),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
