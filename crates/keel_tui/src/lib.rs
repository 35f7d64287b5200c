use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use keel_traits::{DashboardSnapshot, EpochCountdown, NodeStatus, Tuning};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::Line,
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use std::io;
use std::sync::Arc;

/// Read-only view the shell renders from. Orchestration state stays on
/// the other side of this seam.
pub trait DashboardFeed: Send + Sync {
    fn snapshot(&self) -> Option<DashboardSnapshot>;
    fn countdown(&self) -> EpochCountdown;
    fn node_status(&self) -> NodeStatus;
    fn node_logs(&self) -> Vec<String>;
    fn using_local_fallback(&self) -> bool;
    fn last_error(&self) -> Option<String>;
    fn tuning(&self) -> Tuning;
    fn request_refresh(&self);
}

fn format_countdown(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn countdown_color(remaining_secs: u64, tuning: &Tuning) -> Color {
    if remaining_secs > tuning.countdown_warn_secs {
        Color::Green
    } else if remaining_secs > tuning.countdown_critical_secs {
        Color::Yellow
    } else {
        Color::Red
    }
}

fn status_color(status: NodeStatus) -> Color {
    match status {
        NodeStatus::Running => Color::Green,
        NodeStatus::Starting | NodeStatus::Syncing | NodeStatus::Stopping => Color::Yellow,
        NodeStatus::Error => Color::Red,
        NodeStatus::Stopped => Color::DarkGray,
    }
}

pub async fn run_tui(feed: Arc<dyn DashboardFeed>) -> Result<()> {
    // Setup Terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let tuning = feed.tuning();

    // Main Loop
    loop {
        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .margin(1)
                .constraints(
                    [
                        Constraint::Length(3),      // Header
                        Constraint::Percentage(55), // Body
                        Constraint::Min(5),         // Logs
                        Constraint::Length(3),      // Footer
                    ]
                    .as_ref(),
                )
                .split(f.size());

            let countdown = feed.countdown();
            let status = feed.node_status();
            let header_text = format!(
                "KEEL Validator Dashboard | node: {} | epoch ends in {}{}",
                status,
                format_countdown(countdown.remaining_secs),
                if feed.using_local_fallback() {
                    " | LOCAL-ONLY (unverified)"
                } else {
                    ""
                }
            );
            let header = Paragraph::new(header_text)
                .style(
                    Style::default().fg(countdown_color(countdown.remaining_secs, &tuning)),
                )
                .block(Block::default().borders(Borders::ALL));
            f.render_widget(header, chunks[0]);

            let body_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
                .split(chunks[1]);

            let left_text: Vec<Line> = match feed.snapshot() {
                Some(snap) => vec![
                    Line::from(format!("Network:  {}", snap.node_info.network)),
                    Line::from(format!("Height:   {}", snap.node_info.block_height)),
                    Line::from(format!("Synced:   {}", snap.health.synced)),
                    Line::from(format!("Peers:    {}", snap.peers.len())),
                    Line::from(format!(
                        "Epoch:    {}",
                        snap.reward.as_ref().map(|r| r.epoch).unwrap_or(0)
                    )),
                ],
                None => match feed.last_error() {
                    // First load failed: explicit error with retry hint.
                    Some(e) => vec![
                        Line::from(format!("Network unreachable: {}", e)),
                        Line::from("Press 'r' to retry."),
                    ],
                    None => vec![Line::from("Loading...")],
                },
            };
            let left = Paragraph::new(left_text)
                .style(Style::default().fg(status_color(status)))
                .block(Block::default().title("Network").borders(Borders::ALL));
            f.render_widget(left, body_chunks[0]);

            let validators: Vec<ListItem> = feed
                .snapshot()
                .map(|snap| {
                    snap.validators
                        .iter()
                        .map(|v| {
                            ListItem::new(format!(
                                "{} {} ({} staked)",
                                if v.active { "+" } else { "-" },
                                v.address,
                                v.stake
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let right = List::new(validators)
                .block(Block::default().title("Validators").borders(Borders::ALL));
            f.render_widget(right, body_chunks[1]);

            let logs: Vec<ListItem> = feed
                .node_logs()
                .iter()
                .rev()
                .take(chunks[2].height.saturating_sub(2) as usize)
                .rev()
                .map(|l| ListItem::new(l.clone()))
                .collect();
            let log_list =
                List::new(logs).block(Block::default().title("Node Log").borders(Borders::ALL));
            f.render_widget(log_list, chunks[2]);

            let footer = Paragraph::new("'q' quit | 'r' refresh")
                .block(Block::default().borders(Borders::ALL));
            f.render_widget(footer, chunks[3]);
        })?;

        // Event Handling
        if event::poll(std::time::Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') => break,
                    KeyCode::Char('r') => feed.request_refresh(),
                    _ => {}
                }
            }
        }
    }

    // Restore Terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}
