use std::io::{self, Stdout};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::progress::{ProgressSink, Status};
use crate::RolloutError;

pub struct App {
    pub machines: Vec<MachineRow>,
    pub rollback: Option<(u32, String)>,
    pub message: Option<String>,
    pub cancelling: bool,
}

#[derive(Clone)]
pub struct MachineRow {
    pub id: String,
    pub status: Status,
    pub message: String,
}

impl App {
    pub fn new() -> Self {
        Self {
            machines: Vec::new(),
            rollback: None,
            message: None,
            cancelling: false,
        }
    }

    pub fn update_machine(&mut self, id: &str, status: Status, message: &str) {
        match self.machines.iter_mut().find(|m| m.id == id) {
            Some(row) => {
                row.status = status;
                row.message = message.to_string();
            }
            None => self.machines.push(MachineRow {
                id: id.to_string(),
                status,
                message: message.to_string(),
            }),
        }
    }

    pub fn set_rollback(&mut self, attempt: u32, cause: &str) {
        self.rollback = Some((attempt, cause.to_string()));
    }

    pub fn set_message(&mut self, msg: String) {
        self.message = Some(msg);
    }

    pub fn count(&self, status: Status) -> usize {
        self.machines.iter().filter(|m| m.status == status).count()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

pub type Tui = Terminal<CrosstermBackend<Stdout>>;

pub fn init() -> io::Result<Tui> {
    io::stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    Terminal::new(CrosstermBackend::new(io::stdout()))
}

pub fn restore() -> io::Result<()> {
    io::stdout().execute(LeaveAlternateScreen)?;
    disable_raw_mode()?;
    Ok(())
}

pub fn draw(frame: &mut Frame, app: &App) {
    let area = frame.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Min(5),     // Table
            Constraint::Length(3),  // Footer
        ])
        .split(area);

    // Header
    let header_text = match &app.rollback {
        Some((attempt, cause)) => format!(
            "Rolling back (attempt {}): {}",
            attempt,
            truncate_str(cause, 80)
        ),
        None => format!(
            "{} machine(s): {} ok, {} running, {} failed",
            app.machines.len(),
            app.count(Status::Success),
            app.count(Status::Running),
            app.count(Status::Failure)
        ),
    };
    let header_style = if app.rollback.is_some() {
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
    };

    let header = Paragraph::new(header_text)
        .style(header_style)
        .block(Block::default().borders(Borders::ALL).title(" Fleet Rollout "));
    frame.render_widget(header, chunks[0]);

    // Table
    let header_cells = ["", "Machine", "Status", "Step"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header_row = Row::new(header_cells).height(1);

    let rows = app.machines.iter().map(|machine| {
        let (icon, style) = match machine.status {
            Status::Success => ("●", Style::default().fg(Color::Green)),
            Status::Running => ("◐", Style::default().fg(Color::Yellow)),
            Status::Failure => ("✗", Style::default().fg(Color::Red)),
        };

        Row::new(vec![
            Cell::from(icon).style(style),
            Cell::from(machine.id.clone()).style(Style::default().fg(Color::White)),
            Cell::from(machine.status.to_string()).style(style),
            Cell::from(truncate_str(&machine.message, 80)).style(Style::default().fg(Color::Gray)),
        ])
    });

    let widths = [
        Constraint::Length(2),
        Constraint::Length(20),
        Constraint::Length(10),
        Constraint::Min(30),
    ];

    let table = Table::new(rows, widths)
        .header(header_row)
        .block(Block::default().borders(Borders::ALL).title(" Machines "));
    frame.render_widget(table, chunks[1]);

    // Footer
    let footer_text = if let Some(msg) = &app.message {
        msg.clone()
    } else if app.cancelling {
        "Cancelling, releasing leases...".to_string()
    } else {
        "Rolling out... Press 'q' to cancel".to_string()
    };

    let footer = Paragraph::new(footer_text)
        .style(Style::default().fg(Color::Gray))
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(footer, chunks[2]);
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// `true` wenn der Benutzer abbrechen möchte (`q` oder Ctrl-C).
pub fn handle_events() -> io::Result<bool> {
    if event::poll(Duration::from_millis(100))? {
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                return Ok(false);
            }
            let ctrl_c = key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
            return Ok(key.code == KeyCode::Char('q') || ctrl_c);
        }
    }
    Ok(false)
}

pub enum TuiMessage {
    Status { id: String, status: Status, message: String },
    Rollback { attempt: u32, cause: String },
    Finish(String),
}

/// Progress-Sink der in die Live-Tabelle schreibt.
#[derive(Clone)]
pub struct TuiProgress {
    tx: mpsc::UnboundedSender<TuiMessage>,
}

/// Besitzt den Render-Task, siehe [`TuiHandle::finish`].
pub struct TuiHandle {
    tx: mpsc::UnboundedSender<TuiMessage>,
    render: JoinHandle<io::Result<()>>,
}

impl TuiProgress {
    /// Startet das Rendering in einem Blocking-Task.
    ///
    /// `q` oder Ctrl-C lösen `cancel` aus; die Session beendet sich dann
    /// selbst und gibt ihre Leases frei.
    pub fn start(cancel: CancellationToken) -> Result<(Self, TuiHandle), RolloutError> {
        let mut terminal = init().map_err(RolloutError::Terminal)?;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let render = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut app = App::new();
            loop {
                while let Ok(msg) = rx.try_recv() {
                    match msg {
                        TuiMessage::Status { id, status, message } => app.update_machine(&id, status, &message),
                        TuiMessage::Rollback { attempt, cause } => app.set_rollback(attempt, &cause),
                        TuiMessage::Finish(summary) => {
                            app.set_message(summary);
                            terminal.draw(|f| draw(f, &app))?;
                            return Ok(());
                        }
                    }
                }

                terminal.draw(|f| draw(f, &app))?;

                if handle_events()? && !app.cancelling {
                    app.cancelling = true;
                    cancel.cancel();
                }

                if rx.is_closed() && rx.is_empty() {
                    return Ok(());
                }
            }
        });

        let handle = TuiHandle {
            tx: tx.clone(),
            render,
        };
        Ok((Self { tx }, handle))
    }
}

impl TuiHandle {
    /// Beendet das Rendering und stellt das Terminal wieder her.
    pub async fn finish(self, summary: impl Into<String>) -> Result<(), RolloutError> {
        let _ = self.tx.send(TuiMessage::Finish(summary.into()));
        let rendered = self
            .render
            .await
            .map_err(|err| RolloutError::Worker(err.to_string()));
        restore().map_err(RolloutError::Terminal)?;
        rendered?.map_err(RolloutError::Terminal)
    }
}

impl ProgressSink for TuiProgress {
    fn log_status(&self, machine_id: &str, status: Status, message: &str) {
        let _ = self.tx.send(TuiMessage::Status {
            id: machine_id.to_string(),
            status,
            message: message.to_string(),
        });
    }

    fn on_rollback(&self, attempt: u32, cause: &str) {
        let _ = self.tx.send(TuiMessage::Rollback {
            attempt,
            cause: cause.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_keep_first_seen_order() {
        let mut app = App::new();
        app.update_machine("m2", Status::Running, "Acquiring lease for m2");
        app.update_machine("m1", Status::Running, "Acquiring lease for m1");
        app.update_machine("m2", Status::Success, "done");

        let ids: Vec<&str> = app.machines.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(app.count(Status::Success), 1);
        assert_eq!(app.count(Status::Running), 1);
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a very long message", 10), "a very ...");
    }

    #[test]
    fn test_draw_renders_machines() {
        use ratatui::backend::TestBackend;

        let mut app = App::new();
        app.update_machine("m1", Status::Failure, "smoke test failed");
        app.set_rollback(2, "failed to update machine m1");

        let mut terminal = Terminal::new(TestBackend::new(100, 12)).unwrap();
        terminal.draw(|f| draw(f, &app)).unwrap();

        let content: String = terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|c| c.symbol())
            .collect();
        assert!(content.contains("Rolling back (attempt 2)"));
        assert!(content.contains("smoke test failed"));
    }
}
