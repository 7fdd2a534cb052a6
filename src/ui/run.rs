use crate::config::{BillingPeriod, ConfigPatch};
use crate::error::AppError;
use crate::models::{ModelUsage, TrendDirection, UsageQuery};
use crate::service::UsageTracker;
use crate::ui::app::{AppState, ConfirmAction, DashboardView, Screen};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};
use ratatui::Terminal;
use std::io;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tracing::{info, warn};

const ACTIONS: [(&str, &str); 4] = [
    ("Refresh now", "r/Enter"),
    ("Cycle billing period", "p/Enter"),
    ("Clean up old usage", "c/Enter"),
    ("Quit application", "q/Enter"),
];

const RECENT_ROWS: usize = 12;

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_INFO: Color = Color::Green;
const COLOR_WARN: Color = Color::Yellow;
const COLOR_ALERT: Color = Color::Red;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;

pub async fn run_tui(tracker: Arc<UsageTracker>, tick_rate: StdDuration) -> Result<(), AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(&mut terminal, &tracker, tick_rate).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    tracker: &Arc<UsageTracker>,
    tick_rate: StdDuration,
) -> Result<(), AppError> {
    let mut state = AppState::default();
    let mut last_tick = Instant::now();

    refresh_dashboard(&mut state, tracker).await;

    while state.running {
        terminal.draw(|f| render(f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0));

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                handle_key(key.code, key.modifiers, &mut state, tracker).await;
            }
        }

        if state.screen == Screen::Dashboard && last_tick.elapsed() >= tick_rate {
            refresh_dashboard(&mut state, tracker).await;
            last_tick = Instant::now();
        }
    }

    Ok(())
}

fn ask_confirm(state: &mut AppState, action: ConfirmAction) {
    state.previous_screen = state.screen.clone();
    state.screen = Screen::Confirm(action);
    state.confirm_selected = 0;
    state.action_focused = false;
}

async fn handle_key(
    code: KeyCode,
    modifiers: KeyModifiers,
    state: &mut AppState,
    tracker: &Arc<UsageTracker>,
) {
    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        ask_confirm(state, ConfirmAction::Quit);
        return;
    }

    if code == KeyCode::Char('z') && state.screen == Screen::Dashboard {
        state.compact_mode = !state.compact_mode;
        state.status = if state.compact_mode {
            "compact mode enabled".into()
        } else {
            "compact mode disabled".into()
        };
        return;
    }

    match state.screen.clone() {
        Screen::Dashboard if state.action_focused => match code {
            KeyCode::Esc => state.action_focused = false,
            KeyCode::Up => state.action_selected = state.action_selected.saturating_sub(1),
            KeyCode::Down => {
                if state.action_selected + 1 < ACTIONS.len() {
                    state.action_selected += 1;
                }
            }
            KeyCode::Enter => {
                state.action_focused = false;
                match state.action_selected {
                    0 => refresh_dashboard(state, tracker).await,
                    1 => cycle_billing_period(state, tracker).await,
                    2 => ask_confirm(state, ConfirmAction::Cleanup),
                    3 => ask_confirm(state, ConfirmAction::Quit),
                    _ => {}
                }
            }
            _ => {}
        },
        Screen::Dashboard => match code {
            KeyCode::Char('a') => state.action_focused = true,
            KeyCode::Char('q') => ask_confirm(state, ConfirmAction::Quit),
            KeyCode::Char('r') => refresh_dashboard(state, tracker).await,
            KeyCode::Char('p') => cycle_billing_period(state, tracker).await,
            KeyCode::Char('c') => ask_confirm(state, ConfirmAction::Cleanup),
            _ => {}
        },
        Screen::Confirm(action) => match code {
            KeyCode::Left | KeyCode::Right | KeyCode::Tab => {
                state.confirm_selected = 1 - state.confirm_selected.min(1);
            }
            KeyCode::Esc => state.screen = state.previous_screen.clone(),
            KeyCode::Enter => {
                if state.confirm_selected == 0 {
                    state.screen = state.previous_screen.clone();
                    return;
                }
                state.screen = Screen::Dashboard;
                match action {
                    ConfirmAction::Quit => state.running = false,
                    ConfirmAction::Cleanup => run_cleanup(state, tracker).await,
                }
            }
            _ => {}
        },
        Screen::ErrorDialog | Screen::InfoDialog => {
            if matches!(code, KeyCode::Enter | KeyCode::Esc) {
                state.screen = state.previous_screen.clone();
            }
        }
    }
}

fn show_error(state: &mut AppState, message: String) {
    state.error_message = message;
    state.previous_screen = Screen::Dashboard;
    state.screen = Screen::ErrorDialog;
}

fn show_info(state: &mut AppState, message: String) {
    state.info_message = message;
    state.previous_screen = Screen::Dashboard;
    state.screen = Screen::InfoDialog;
}

/// Runs a blocking tracker call on the blocking pool.
async fn on_tracker<T, F>(tracker: &Arc<UsageTracker>, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&UsageTracker) -> Result<T, AppError> + Send + 'static,
{
    let tracker = Arc::clone(tracker);
    tokio::task::spawn_blocking(move || f(&tracker))
        .await
        .map_err(|e| AppError::Io(io::Error::other(e)))?
}

pub(crate) fn load_view(tracker: &UsageTracker) -> Result<DashboardView, AppError> {
    let stats = tracker.current_stats()?;
    let period = UsageQuery::between(stats.current_period_start, stats.current_period_end);
    let agg = tracker.aggregate(&period)?;
    let recent = tracker.query(&UsageQuery {
        limit: RECENT_ROWS,
        ..UsageQuery::default()
    })?;

    Ok(DashboardView {
        stats: Some(stats),
        billing_period: tracker.config().billing_period,
        models: models_by_cost(agg.model_usage.into_iter()),
        recent,
        last_refresh: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    })
}

fn models_by_cost(models: impl Iterator<Item = (String, ModelUsage)>) -> Vec<(String, ModelUsage)> {
    let mut models: Vec<_> = models.collect();
    models.sort_by(|a, b| b.1.cost.total_cmp(&a.1.cost).then_with(|| a.0.cmp(&b.0)));
    models
}

async fn refresh_dashboard(state: &mut AppState, tracker: &Arc<UsageTracker>) {
    state.status = "refreshing...".into();
    match on_tracker(tracker, load_view).await {
        Ok(view) => {
            state.view = view;
            state.status = "ok".into();
        }
        Err(err) => {
            warn!(error = %err, "dashboard refresh failed");
            state.status = format!("refresh failed: {err}");
        }
    }
}

pub(crate) fn next_billing_period(period: BillingPeriod) -> BillingPeriod {
    match period {
        BillingPeriod::Daily => BillingPeriod::Weekly,
        BillingPeriod::Weekly => BillingPeriod::Monthly,
        BillingPeriod::Monthly => BillingPeriod::Daily,
    }
}

async fn cycle_billing_period(state: &mut AppState, tracker: &Arc<UsageTracker>) {
    let next = next_billing_period(state.view.billing_period);
    let patch = ConfigPatch {
        billing_period: Some(next),
        ..ConfigPatch::default()
    };
    match on_tracker(tracker, move |t| t.update_config(&patch)).await {
        Ok(cfg) => {
            info!(billing_period = %cfg.billing_period, "billing period changed from dashboard");
            refresh_dashboard(state, tracker).await;
            state.status = format!("billing period: {}", cfg.billing_period);
        }
        Err(err) => show_error(state, format!("Could not update billing period: {err}")),
    }
}

async fn run_cleanup(state: &mut AppState, tracker: &Arc<UsageTracker>) {
    match on_tracker(tracker, |t| t.cleanup(None)).await {
        Ok(report) => {
            refresh_dashboard(state, tracker).await;
            show_info(
                state,
                format!(
                    "Kept {} entries, removed {}, pruned {} stale exports.",
                    report.kept, report.removed, report.exports_pruned
                ),
            );
        }
        Err(err) => show_error(state, format!("Cleanup failed: {err}")),
    }
}

pub(crate) fn quota_label(used: f64, quota: Option<f64>, percent: f64, money: bool) -> String {
    let fmt = |v: f64| {
        if money {
            format!("${v:.4}")
        } else {
            format!("{v:.0}")
        }
    };
    match quota {
        Some(q) => format!("{} / {} ({percent:.1}%)", fmt(used), fmt(q)),
        None => format!("{} (no quota)", fmt(used)),
    }
}

fn percent_color(percent: f64) -> Color {
    if percent >= 90.0 {
        COLOR_ALERT
    } else if percent >= 75.0 {
        COLOR_WARN
    } else {
        COLOR_INFO
    }
}

fn trend_span(trend: TrendDirection) -> Span<'static> {
    let color = match trend {
        TrendDirection::Increasing => COLOR_WARN,
        TrendDirection::Decreasing => COLOR_INFO,
        TrendDirection::Stable => COLOR_MUTED,
    };
    Span::styled(trend.as_label(), Style::default().fg(color))
}

fn render(f: &mut ratatui::Frame, state: &AppState) {
    let size = f.area();
    let compact = state.compact_mode || size.width < 120;

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(5),
            Constraint::Min(6),
            Constraint::Length(2),
        ])
        .split(size);

    let window = state
        .view
        .stats
        .as_ref()
        .map(|s| {
            format!(
                "{} → {}",
                s.current_period_start.format("%Y-%m-%d"),
                s.current_period_end.format("%Y-%m-%d")
            )
        })
        .unwrap_or_else(|| "-".into());
    let header = Paragraph::new(format!(
        " ccdash  ·  {} {}  ·  {}  ·  {} ",
        state.view.billing_period, window, state.status, state.view.last_refresh
    ))
    .block(Block::default().borders(Borders::ALL).title(" Billing Period "))
    .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    render_kpis(f, root[1], state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(if compact {
            [
                Constraint::Percentage(40),
                Constraint::Percentage(60),
                Constraint::Length(0),
            ]
        } else {
            [
                Constraint::Percentage(34),
                Constraint::Percentage(44),
                Constraint::Percentage(22),
            ]
        })
        .split(root[2]);

    render_models(f, body[0], state, compact);
    render_recent(f, body[1], state, compact);
    if !compact {
        render_action_panel(f, body[2], state);
    }

    let footer = Paragraph::new(footer_text(state))
        .block(Block::default().borders(Borders::ALL))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[3]);

    match &state.screen {
        Screen::Dashboard => {}
        Screen::Confirm(action) => render_confirm(f, state, action),
        Screen::ErrorDialog => render_error(f, state),
        Screen::InfoDialog => render_info(f, state),
    }
}

fn render_kpis(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let kpis = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(28),
            Constraint::Percentage(24),
            Constraint::Percentage(20),
            Constraint::Percentage(28),
        ])
        .split(area);

    let Some(stats) = &state.view.stats else {
        let empty = Paragraph::new("no data yet")
            .block(Block::default().borders(Borders::ALL).title(" Usage "))
            .style(Style::default().fg(COLOR_MUTED));
        f.render_widget(empty, area);
        return;
    };

    let cost = Paragraph::new(quota_label(
        stats.current_cost,
        stats.cost_quota,
        stats.cost_usage_percent,
        true,
    ))
    .block(Block::default().borders(Borders::ALL).title(" Cost "))
    .style(
        Style::default()
            .fg(percent_color(stats.cost_usage_percent))
            .add_modifier(Modifier::BOLD),
    );
    let tokens = Paragraph::new(quota_label(
        stats.current_tokens as f64,
        stats.token_quota.map(|q| q as f64),
        stats.token_usage_percent,
        false,
    ))
    .block(Block::default().borders(Borders::ALL).title(" Tokens "))
    .style(Style::default().fg(COLOR_ACCENT).add_modifier(Modifier::BOLD));
    let requests = Paragraph::new(quota_label(
        stats.current_requests as f64,
        stats.request_quota.map(|q| q as f64),
        stats.request_usage_percent,
        false,
    ))
    .block(Block::default().borders(Borders::ALL).title(" Requests "))
    .style(Style::default().fg(COLOR_HEADER));
    let projection = Paragraph::new(vec![
        Line::from(format!(
            "${:.2}/mo · {} tok/day",
            stats.projected_monthly_cost, stats.daily_average_tokens
        )),
        Line::from(vec![Span::raw("trend: "), trend_span(stats.trend_direction)]),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Projection "));

    f.render_widget(cost, kpis[0]);
    f.render_widget(tokens, kpis[1]);
    f.render_widget(requests, kpis[2]);
    f.render_widget(projection, kpis[3]);
}

fn render_models(f: &mut ratatui::Frame, area: Rect, state: &AppState, compact: bool) {
    let rows = state
        .view
        .models
        .iter()
        .map(|(model, usage)| {
            Row::new(vec![
                Cell::from(model.clone()),
                Cell::from(usage.requests.to_string()),
                Cell::from(usage.tokens.to_string()),
                Cell::from(format!("${:.4}", usage.cost)),
            ])
        })
        .collect::<Vec<_>>();
    let table = Table::new(
        rows,
        [
            Constraint::Percentage(40),
            Constraint::Percentage(15),
            Constraint::Percentage(20),
            Constraint::Percentage(25),
        ],
    )
    .header(
        Row::new(vec!["Model", "Req", "Tokens", "Cost"]).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    )
    .block(Block::default().borders(Borders::ALL).title(if compact {
        " Models "
    } else {
        " Cost By Model "
    }));
    f.render_widget(table, area);
}

fn render_recent(f: &mut ratatui::Frame, area: Rect, state: &AppState, compact: bool) {
    let rows = state
        .view
        .recent
        .iter()
        .map(|e| {
            Row::new(vec![
                Cell::from(e.timestamp.format("%m-%d %H:%M").to_string()),
                Cell::from(e.instance_id.clone()),
                Cell::from(e.model.clone()),
                Cell::from(e.total_tokens().to_string()),
                Cell::from(format!("${:.4}", e.total_cost)),
            ])
        })
        .collect::<Vec<_>>();
    let table = Table::new(
        rows,
        [
            Constraint::Percentage(20),
            Constraint::Percentage(22),
            Constraint::Percentage(26),
            Constraint::Percentage(14),
            Constraint::Percentage(18),
        ],
    )
    .header(
        Row::new(vec!["When", "Instance", "Model", "Tokens", "Cost"]).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    )
    .block(Block::default().borders(Borders::ALL).title(if compact {
        " Recent "
    } else {
        " Recent Requests "
    }));
    f.render_widget(table, area);
}

fn footer_text(state: &AppState) -> &'static str {
    match state.screen {
        Screen::Dashboard if state.action_focused => "Up/Down choose | Enter run | Esc unfocus actions",
        Screen::Dashboard => {
            "a focus actions | r refresh | p cycle period | c cleanup | z compact | q quit"
        }
        Screen::Confirm(_) => "Left/Right choose | Enter confirm | Esc cancel",
        Screen::ErrorDialog | Screen::InfoDialog => "Enter/Esc close",
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn render_action_panel(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let lines = ACTIONS
        .iter()
        .enumerate()
        .map(|(i, (label, keys))| {
            let selected = state.action_focused && i == state.action_selected;
            let style = if selected {
                Style::default()
                    .fg(Color::Black)
                    .bg(COLOR_ACCENT)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            Line::from(vec![
                Span::styled(label.to_string(), style),
                Span::styled(format!("  [{keys}]"), Style::default().fg(COLOR_MUTED)),
            ])
        })
        .collect::<Vec<_>>();

    let title = if state.action_focused {
        " Actions (focused) "
    } else {
        " Actions "
    };
    let panel = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: true });
    f.render_widget(panel, area);
}

fn render_confirm(f: &mut ratatui::Frame, state: &AppState, action: &ConfirmAction) {
    let area = centered_rect(56, 34, f.area());
    f.render_widget(Clear, area);

    let (title, message, consequence) = match action {
        ConfirmAction::Quit => (
            "Confirm Quit",
            "Do you want to exit ccdash?",
            "Consequence: closes the dashboard and returns to shell.",
        ),
        ConfirmAction::Cleanup => (
            "Confirm Cleanup",
            "Remove usage entries older than the retention window?",
            "Consequence: old entries are deleted from the usage log.",
        ),
    };

    let cancel_style = if state.confirm_selected == 0 {
        Style::default()
            .fg(Color::Black)
            .bg(Color::Yellow)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let confirm_style = if state.confirm_selected == 1 {
        Style::default()
            .fg(Color::Black)
            .bg(Color::Red)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let content = Paragraph::new(vec![
        Line::from(message),
        Line::from(Span::styled(consequence, Style::default().fg(COLOR_MUTED))),
        Line::from(""),
        Line::from(vec![
            Span::styled("[Cancel (Esc)]", cancel_style),
            Span::raw("   "),
            Span::styled("[Confirm (Enter)]", confirm_style),
        ]),
        Line::from("Use Left/Right to choose"),
    ])
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" {} ", title)),
    )
    .alignment(Alignment::Center);

    f.render_widget(content, area);
}

fn render_error(f: &mut ratatui::Frame, state: &AppState) {
    let area = centered_rect(60, 30, f.area());
    f.render_widget(Clear, area);
    let content = Paragraph::new(vec![
        Line::from(state.error_message.clone()),
        Line::from(""),
        Line::from("Press Enter or Esc"),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Error "))
    .style(Style::default().fg(Color::Red))
    .wrap(Wrap { trim: true });
    f.render_widget(content, area);
}

fn render_info(f: &mut ratatui::Frame, state: &AppState) {
    let area = centered_rect(60, 30, f.area());
    f.render_widget(Clear, area);
    let content = Paragraph::new(vec![
        Line::from(state.info_message.clone()),
        Line::from(""),
        Line::from("Press Enter or Esc"),
    ])
    .block(Block::default().borders(Borders::ALL).title(" Details "))
    .style(Style::default().fg(Color::Yellow))
    .wrap(Wrap { trim: true });
    f.render_widget(content, area);
}
