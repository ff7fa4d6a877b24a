use std::io::{self, Stdout, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table};
use ratatui::{Frame, Terminal};
use sqlchat_adapters::export::{
    export_table_to_csv, export_table_to_json, DEFAULT_CSV_FILE_NAME, DEFAULT_JSON_FILE_NAME,
};
use sqlchat_core::chat_session::{ChatSession, SessionError};
use sqlchat_core::limits::{cycle_limit, limit_label, next_truncation_limit};
use sqlchat_core::message::{Message, Role};
use sqlchat_core::message_view::{MessageAction, MessageView, PresentationVariant};
use sqlchat_core::results_table::{ResultsTable, NO_RESULTS_TEXT};
use sqlchat_core::settings::ClientSettings;
use sqlchat_core::text2sql::GenerationBackend;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const TICK_RATE: Duration = Duration::from_millis(120);
const INPUT_PLACEHOLDER: &str = "Ask a question about your data...";

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Input,
    Messages,
}

impl Focus {
    fn toggled(self) -> Self {
        match self {
            Self::Input => Self::Messages,
            Self::Messages => Self::Input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionKey {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    ToggleFocus,
    ToggleMode,
    ClearHistory,
    Close,
    Input(char),
    Backspace,
    Submit,
    Navigate(DirectionKey),
    Page(DirectionKey),
    Invoke(MessageAction),
    /// Re-run the selected truncated table with the n-th truncation option.
    ChooseLimit(usize),
    Tick,
}

#[derive(Debug)]
enum TaskOutcome {
    Sent(Result<Message, SessionError>),
    Ran {
        message_id: String,
        result: Result<Option<Message>, SessionError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FullScreen {
    message_id: String,
    page: usize,
}

/// Client-side options for one chat screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatScreenOptions {
    pub variant: PresentationVariant,
    pub page_size: usize,
    pub export_dir: PathBuf,
}

impl ChatScreenOptions {
    #[must_use]
    pub fn from_settings(settings: &ClientSettings, export_dir: PathBuf) -> Self {
        Self {
            variant: settings.variant,
            page_size: settings.page_size.max(1),
            export_dir,
        }
    }
}

struct TuiApp<B> {
    session: Arc<ChatSession<B>>,
    runtime: Handle,
    outcomes_tx: UnboundedSender<TaskOutcome>,
    outcomes_rx: UnboundedReceiver<TaskOutcome>,
    options: ChatScreenOptions,
    focus: Focus,
    input: String,
    selected: Option<usize>,
    full_screen: Option<FullScreen>,
    show_help: bool,
    should_quit: bool,
    status_line: String,
    clipboard: Option<String>,
}

impl<B: GenerationBackend + 'static> TuiApp<B> {
    fn new(session: Arc<ChatSession<B>>, runtime: Handle, options: ChatScreenOptions) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            session,
            runtime,
            outcomes_tx,
            outcomes_rx,
            options,
            focus: Focus::Input,
            input: String::new(),
            selected: None,
            full_screen: None,
            show_help: false,
            should_quit: false,
            status_line: "Type a question and press Enter".to_string(),
            clipboard: None,
        }
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Quit => self.should_quit = true,
            Msg::ToggleHelp => self.show_help = !self.show_help,
            Msg::ToggleFocus => {
                self.focus = self.focus.toggled();
                if self.focus == Focus::Messages && self.selected.is_none() {
                    self.selected = self.last_selectable();
                }
            }
            Msg::ToggleMode => self.toggle_mode(),
            Msg::ClearHistory => {
                self.session.store().clear_history();
                self.selected = None;
                self.full_screen = None;
                self.status_line = "Chat history cleared".to_string();
            }
            Msg::Close => {
                if self.show_help {
                    self.show_help = false;
                } else if self.full_screen.is_some() {
                    self.full_screen = None;
                } else {
                    self.focus = Focus::Input;
                }
            }
            Msg::Input(character) => self.input.push(character),
            Msg::Backspace => {
                self.input.pop();
            }
            Msg::Submit => self.submit_prompt(),
            Msg::Navigate(direction) => self.navigate(direction),
            Msg::Page(direction) => self.turn_page(direction),
            Msg::Invoke(action) => self.invoke(action),
            Msg::ChooseLimit(index) => self.choose_limit(index),
            Msg::Tick => self.drain_outcomes(),
        }
    }

    fn toggle_mode(&mut self) {
        if self.session.is_sending() {
            self.status_line = "Mode can be changed once the reply arrives".to_string();
            return;
        }
        let store = self.session.store();
        let mode = store.mode().toggled();
        store.set_mode(mode);
        self.status_line = mode.description().to_string();
    }

    fn submit_prompt(&mut self) {
        let prompt = self.input.trim().to_string();
        if prompt.is_empty() {
            self.status_line = "Type a question first".to_string();
            return;
        }
        if self.session.is_sending() {
            self.status_line = "Still waiting for the previous reply".to_string();
            return;
        }

        self.input.clear();
        self.status_line = "Generating SQL...".to_string();
        let session = Arc::clone(&self.session);
        let outcomes = self.outcomes_tx.clone();
        self.runtime.spawn(async move {
            let result = session.send_prompt(&prompt).await;
            let _ = outcomes.send(TaskOutcome::Sent(result));
        });
    }

    fn start_run(&mut self, message_id: String, limit: Option<u32>) {
        if self.session.is_running(&message_id) {
            self.status_line = "This query is already running".to_string();
            return;
        }

        self.status_line = match limit {
            Some(limit) => format!("Running query with {}...", limit_label(limit)),
            None => "Running query...".to_string(),
        };
        let session = Arc::clone(&self.session);
        let outcomes = self.outcomes_tx.clone();
        self.runtime.spawn(async move {
            let result = match limit {
                Some(limit) => session.rerun_with_limit(&message_id, limit).await,
                None => session.run_query(&message_id).await,
            };
            let _ = outcomes.send(TaskOutcome::Ran { message_id, result });
        });
    }

    fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            self.apply_outcome(outcome);
        }
    }

    fn apply_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Sent(Ok(reply)) => {
                self.status_line = if reply.sql.is_some() {
                    "SQL generated".to_string()
                } else {
                    "Reply received".to_string()
                };
                self.selected = self.last_selectable().or(self.selected);
            }
            TaskOutcome::Sent(Err(SessionError::HistoryCleared)) => {
                self.status_line = "Reply discarded after clearing history".to_string();
            }
            TaskOutcome::Sent(Err(error)) => {
                tracing::warn!(%error, "prompt failed");
                self.status_line = format!("Request failed: {error}");
            }
            TaskOutcome::Ran {
                result: Ok(Some(message)),
                ..
            } => {
                self.status_line = match (&message.run_error, &message.results) {
                    (Some(_), _) => "Query failed".to_string(),
                    (None, Some(rows)) => format!("Query returned {} rows", rows.len()),
                    (None, None) => "Query executed".to_string(),
                };
            }
            TaskOutcome::Ran {
                result: Ok(None), ..
            } => {
                self.status_line = "Message was cleared before the run finished".to_string();
            }
            TaskOutcome::Ran {
                message_id,
                result: Err(error),
            } => {
                tracing::warn!(%error, message_id, "run failed");
                self.status_line = format!("Run failed: {error}");
            }
        }
    }

    fn selectable_indexes(&self) -> Vec<usize> {
        self.session
            .store()
            .messages()
            .iter()
            .enumerate()
            .filter(|(_, message)| message.role == Role::Assistant && message.display_sql().is_some())
            .map(|(index, _)| index)
            .collect()
    }

    fn last_selectable(&self) -> Option<usize> {
        self.selectable_indexes().last().copied()
    }

    fn navigate(&mut self, direction: DirectionKey) {
        let candidates = self.selectable_indexes();
        if candidates.is_empty() {
            self.selected = None;
            self.status_line = "No generated SQL to select yet".to_string();
            return;
        }

        let next = match (direction, self.selected) {
            (DirectionKey::Up | DirectionKey::Left, Some(current)) => candidates
                .iter()
                .rev()
                .find(|index| **index < current)
                .or(candidates.first()),
            (DirectionKey::Down | DirectionKey::Right, Some(current)) => candidates
                .iter()
                .find(|index| **index > current)
                .or(candidates.last()),
            (_, None) => candidates.last(),
        };
        self.selected = next.copied();
    }

    fn selected_message(&self) -> Option<Message> {
        let index = self.selected?;
        self.session
            .store()
            .messages()
            .into_iter()
            .nth(index)
            .filter(|message| message.role == Role::Assistant)
    }

    fn invoke(&mut self, action: MessageAction) {
        let Some(message) = self.selected_message() else {
            self.status_line = "Select a message with SQL first".to_string();
            return;
        };

        let store_limit = self.session.store().limit();
        let running = self.session.is_running(&message.id);
        let view =
            MessageView::from_message(&message, store_limit, self.options.variant, running);
        if !view.has_action(action) {
            self.status_line = format!("{} is not available for this message", action.title());
            return;
        }

        match action {
            MessageAction::CopySql => {
                if let Some(sql) = view.sql.as_ref().map(|block| block.sql.to_string()) {
                    self.clipboard = Some(sql);
                    self.status_line = "SQL copied to clipboard".to_string();
                }
            }
            MessageAction::Run => self.start_run(message.id.clone(), None),
            MessageAction::CycleLimit => {
                let limit = cycle_limit(store_limit);
                self.session.store().set_limit(limit);
                self.status_line = format!("Limit: {}", limit_label(limit));
            }
            MessageAction::ChangeLimit => {
                let current = view
                    .results
                    .as_ref()
                    .and_then(|table| table.active_limit())
                    .unwrap_or(store_limit);
                match next_truncation_limit(current) {
                    Some(limit) => self.start_run(message.id.clone(), Some(limit)),
                    None => {
                        self.status_line = "Already showing the largest row limit".to_string();
                    }
                }
            }
            MessageAction::ExportCsv => {
                if let Some(table) = &view.results {
                    let path = self.options.export_dir.join(DEFAULT_CSV_FILE_NAME);
                    self.status_line = match export_table_to_csv(&path, table) {
                        Ok(rows) => format!("Exported {rows} rows to {}", path.display()),
                        Err(error) => {
                            tracing::warn!(%error, "csv export failed");
                            format!("Export failed: {error}")
                        }
                    };
                }
            }
            MessageAction::ExportJson => {
                if let Some(table) = &view.results {
                    let path = self.options.export_dir.join(DEFAULT_JSON_FILE_NAME);
                    self.status_line = match export_table_to_json(&path, table) {
                        Ok(rows) => format!("Exported {rows} rows to {}", path.display()),
                        Err(error) => {
                            tracing::warn!(%error, "json export failed");
                            format!("Export failed: {error}")
                        }
                    };
                }
            }
            MessageAction::FullScreen => {
                self.full_screen = Some(FullScreen {
                    message_id: message.id.clone(),
                    page: 0,
                });
            }
        }
    }

    /// Re-runs the selected message with `truncation_options()[index]` rows.
    fn choose_limit(&mut self, index: usize) {
        let Some(message) = self.selected_message() else {
            self.status_line = "Select a message with SQL first".to_string();
            return;
        };

        let store_limit = self.session.store().limit();
        let running = self.session.is_running(&message.id);
        let view =
            MessageView::from_message(&message, store_limit, self.options.variant, running);
        let choice = view
            .results
            .as_ref()
            .filter(|_| view.has_action(MessageAction::ChangeLimit))
            .and_then(|table| table.truncation_options().get(index).copied());
        match choice {
            Some(limit) => self.start_run(message.id.clone(), Some(limit)),
            None => {
                self.status_line = format!(
                    "{} is not available for this message",
                    MessageAction::ChangeLimit.title()
                );
            }
        }
    }

    fn turn_page(&mut self, direction: DirectionKey) {
        let Some(full_screen) = &self.full_screen else {
            self.navigate(direction);
            return;
        };
        let page_count = self
            .session
            .store()
            .message(&full_screen.message_id)
            .and_then(|message| message.results)
            .map_or(0, |rows| ResultsTable::new(&rows, None).page_count(self.options.page_size));

        if let Some(full_screen) = &mut self.full_screen {
            full_screen.page = match direction {
                DirectionKey::Up | DirectionKey::Left => full_screen.page.saturating_sub(1),
                DirectionKey::Down | DirectionKey::Right => {
                    (full_screen.page + 1).min(page_count.saturating_sub(1))
                }
            };
        }
    }

    fn take_clipboard(&mut self) -> Option<String> {
        self.clipboard.take()
    }
}

/// Escape sequence asking the terminal to place `text` on the system clipboard.
fn osc52_sequence(text: &str) -> String {
    format!("\x1b]52;c;{}\x07", BASE64.encode(text))
}

pub fn run<B: GenerationBackend + 'static>(
    session: Arc<ChatSession<B>>,
    runtime: Handle,
    options: ChatScreenOptions,
) -> Result<(), TuiError> {
    let mut terminal = setup_terminal()?;
    let mut app = TuiApp::new(session, runtime, options);
    let run_result = run_loop(&mut terminal, &mut app);
    let restore_result = restore_terminal(&mut terminal);

    if let Err(error) = run_result {
        restore_result?;
        return Err(error);
    }

    restore_result?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop<B: GenerationBackend + 'static>(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut TuiApp<B>,
) -> Result<(), TuiError> {
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|frame| render(frame, app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(message) = map_key_event(key, app.focus) {
                        app.handle(message);
                    }
                }
            }
        }

        if let Some(text) = app.take_clipboard() {
            let backend = terminal.backend_mut();
            backend.write_all(osc52_sequence(&text).as_bytes())?;
            Backend::flush(backend)?;
        }

        if last_tick.elapsed() >= TICK_RATE {
            app.handle(Msg::Tick);
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn render<B: GenerationBackend + 'static>(frame: &mut Frame<'_>, app: &TuiApp<B>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
            Constraint::Length(3),
        ])
        .split(frame.area());

    let store = app.session.store();
    let snapshot = store.snapshot();
    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            format!(" Mode: {} ", snapshot.mode.label()),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | "),
        Span::raw(format!("Limit: {}", limit_label(snapshot.limit))),
        Span::raw(" | "),
        Span::raw(format!(
            "Conversation: {}",
            snapshot.conversation_id.as_deref().unwrap_or("new")
        )),
        Span::raw(" | "),
        Span::raw(if app.session.is_sending() {
            "Generating SQL..."
        } else if app.session.is_loading() {
            "Running query..."
        } else {
            "idle"
        }),
    ]))
    .block(Block::default().borders(Borders::ALL).title("Text2SQL Chat"));
    frame.render_widget(header, chunks[0]);

    let full_screen_message = app
        .full_screen
        .as_ref()
        .and_then(|full_screen| {
            snapshot
                .messages
                .iter()
                .find(|message| message.id == full_screen.message_id)
                .map(|message| (message, full_screen.page))
        });
    match full_screen_message {
        Some((message, page)) => render_full_screen(frame, chunks[1], app, message, page),
        None => render_messages(frame, chunks[1], app, &snapshot.messages, snapshot.limit),
    }

    let input_style = if app.focus == Focus::Input {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    let input_line = if app.input.is_empty() {
        Line::from(Span::styled(
            INPUT_PLACEHOLDER,
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Line::from(app.input.as_str())
    };
    let input = Paragraph::new(input_line).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(input_style)
            .title("Prompt"),
    );
    frame.render_widget(input, chunks[2]);

    let hints = match app.focus {
        Focus::Input => "Enter: send | Tab: messages | Ctrl+O: mode | Ctrl+L: clear | F1: help",
        Focus::Messages => {
            "j/k: select | c: copy | r: run | n: limit | 1-4/m: more rows | e/J: export | f: full screen"
        }
    };
    let footer = Paragraph::new(vec![
        Line::from(hints),
        Line::from(format!("Status: {}", app.status_line)),
    ])
    .block(Block::default().borders(Borders::ALL).title("Keys"));
    frame.render_widget(footer, chunks[3]);

    if app.show_help {
        render_help_popup(frame);
    }
}

fn render_messages<B: GenerationBackend + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    app: &TuiApp<B>,
    messages: &[Message],
    store_limit: u32,
) {
    let mut lines: Vec<Line<'_>> = Vec::new();
    let mut selected_line = None;

    if messages.is_empty() {
        lines.push(Line::from("Start a conversation by asking a question about your data."));
        lines.push(Line::from(
            "Example: \"Show me the top 10 customers by total order value\"",
        ));
    }

    for (index, message) in messages.iter().enumerate() {
        let running = app.session.is_running(&message.id);
        let view = MessageView::from_message(message, store_limit, app.options.variant, running);
        let is_selected = app.selected == Some(index);
        if is_selected {
            selected_line = Some(lines.len());
        }
        lines.extend(message_lines(&view, is_selected, app.options.page_size));
        lines.push(Line::from(""));
    }

    let height = usize::from(area.height.saturating_sub(2));
    let scroll = match selected_line {
        Some(line) => line.saturating_sub(height / 3),
        None => lines.len().saturating_sub(height),
    };

    let body = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Conversation"))
        .alignment(Alignment::Left)
        .scroll((u16::try_from(scroll).unwrap_or(u16::MAX), 0));
    frame.render_widget(body, area);
}

fn message_lines<'a>(view: &MessageView<'a>, selected: bool, page_size: usize) -> Vec<Line<'a>> {
    let marker = if selected { ">" } else { " " };
    let (speaker, color) = match view.role {
        Role::User => ("You", Color::Cyan),
        Role::Assistant => ("Assistant", Color::Green),
    };

    let mut lines = vec![Line::from(vec![
        Span::raw(format!("{marker} ")),
        Span::styled(
            speaker,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
    ])];
    lines.extend(view.content.lines().map(|line| Line::from(format!("  {line}"))));

    if let Some(block) = &view.sql {
        lines.push(Line::from(Span::styled(
            format!("  SQL ({})", block.dialect),
            Style::default().fg(Color::DarkGray),
        )));
        lines.extend(block.sql.lines().map(|line| {
            Line::from(Span::styled(
                format!("    {line}"),
                Style::default().fg(Color::Yellow),
            ))
        }));

        let mut actions = view
            .actions
            .iter()
            .map(|action| format!("[{}]", action.title()))
            .collect::<Vec<_>>();
        if let Some(label) = &view.limit_label {
            actions.push(format!("({label})"));
        }
        if view.running {
            actions.push("Running query...".to_string());
        }
        lines.push(Line::from(format!("  {}", actions.join(" "))));
    }

    if let Some(error) = view.query_error {
        lines.push(Line::from(Span::styled(
            "  Query Error",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )));
        lines.extend(
            error
                .lines()
                .map(|line| Line::from(Span::styled(format!("    {line}"), Style::default().fg(Color::Red)))),
        );
    }

    if let (Some(table), Some(heading)) = (&view.results, view.results_heading()) {
        lines.push(Line::from(Span::styled(
            format!("  {heading}"),
            Style::default().add_modifier(Modifier::BOLD),
        )));
        lines.extend(results_preview_lines(table, page_size));
    }

    lines
}

fn results_preview_lines(table: &ResultsTable<'_>, page_size: usize) -> Vec<Line<'static>> {
    if table.is_empty() {
        return vec![Line::from(format!("    {NO_RESULTS_TEXT}"))];
    }

    let mut lines = vec![Line::from(Span::styled(
        format!("    {}", table.columns().join(" | ")),
        Style::default().add_modifier(Modifier::UNDERLINED),
    ))];
    let page = table.page(0, page_size);
    for row in &page.rows {
        lines.push(Line::from(format!("    {}", table.row_cells(row).join(" | "))));
    }
    let hidden = table.row_count().saturating_sub(page.rows.len());
    if hidden > 0 {
        lines.push(Line::from(format!("    ... {hidden} more rows (f: full screen)")));
    }
    if table.is_truncated() {
        let options = table
            .truncation_options()
            .iter()
            .enumerate()
            .map(|(index, limit)| format!("{}: {limit}", index + 1))
            .collect::<Vec<_>>()
            .join("  ");
        lines.push(Line::from(Span::styled(
            format!(
                "    Results may be truncated at {} rows. Re-run with {options} rows (m: next)",
                table.row_count()
            ),
            Style::default().fg(Color::Yellow),
        )));
    }
    lines
}

fn render_full_screen<B: GenerationBackend + 'static>(
    frame: &mut Frame<'_>,
    area: Rect,
    app: &TuiApp<B>,
    message: &Message,
    page_index: usize,
) {
    let rows = message.results.as_deref().unwrap_or_default();
    let table = ResultsTable::new(rows, message.results_limit);
    let page = table.page(page_index, app.options.page_size);
    let title = format!(
        "Query results ({}) page {}/{} | h/l: page | Esc: close",
        table.row_count_label(),
        page.index + 1,
        page.page_count.max(1)
    );

    if table.is_empty() {
        let empty = Paragraph::new(NO_RESULTS_TEXT)
            .block(Block::default().borders(Borders::ALL).title(title));
        frame.render_widget(empty, area);
        return;
    }

    let header = Row::new(
        table
            .columns()
            .iter()
            .map(|column| Cell::from(column.clone())),
    )
    .style(Style::default().add_modifier(Modifier::BOLD));
    let body = page
        .rows
        .iter()
        .map(|row| Row::new(table.row_cells(row).into_iter().map(Cell::from)));
    let widths = vec![Constraint::Min(8); table.columns().len()];
    let widget = Table::new(body, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));
    frame.render_widget(widget, area);
}

fn render_help_popup(frame: &mut Frame<'_>) {
    let area = centered_rect(70, 70, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Global keymap"),
        Line::from("Ctrl+C / Ctrl+Q: quit"),
        Line::from("F1: toggle help"),
        Line::from("Tab: switch between prompt and messages"),
        Line::from("Ctrl+O: toggle conversational / one-shot mode"),
        Line::from("Ctrl+L: clear chat history"),
        Line::from("Esc: close popup or full screen"),
        Line::from(""),
        Line::from("Messages"),
        Line::from("Up/Down or j/k: select generated SQL"),
        Line::from("c: copy SQL  r: run  n: cycle limit"),
        Line::from("1-4: re-run a truncated table with 100 / 500 / 1000 / 5000 rows"),
        Line::from("m: re-run with the next larger row limit"),
        Line::from("e: export CSV  J: export JSON  f / Enter: full screen results"),
        Line::from("Left/Right or h/l: change page in full screen"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

fn map_key_event(key: KeyEvent, focus: Focus) -> Option<Msg> {
    match (key.modifiers, key.code) {
        (KeyModifiers::CONTROL, KeyCode::Char('c' | 'q')) => Some(Msg::Quit),
        (KeyModifiers::CONTROL, KeyCode::Char('o')) => Some(Msg::ToggleMode),
        (KeyModifiers::CONTROL, KeyCode::Char('l')) => Some(Msg::ClearHistory),
        (_, KeyCode::F(1)) => Some(Msg::ToggleHelp),
        (_, KeyCode::Tab) => Some(Msg::ToggleFocus),
        (_, KeyCode::Esc) => Some(Msg::Close),
        _ => match focus {
            Focus::Input => map_input_key(key),
            Focus::Messages => map_messages_key(key),
        },
    }
}

fn map_input_key(key: KeyEvent) -> Option<Msg> {
    match (key.modifiers, key.code) {
        (_, KeyCode::Enter) => Some(Msg::Submit),
        (_, KeyCode::Backspace) => Some(Msg::Backspace),
        (KeyModifiers::NONE | KeyModifiers::SHIFT, KeyCode::Char(character)) => {
            Some(Msg::Input(character))
        }
        _ => None,
    }
}

fn map_messages_key(key: KeyEvent) -> Option<Msg> {
    match key.code {
        KeyCode::Char('q') => Some(Msg::Quit),
        KeyCode::Char('?') => Some(Msg::ToggleHelp),
        KeyCode::Up | KeyCode::Char('k') => Some(Msg::Navigate(DirectionKey::Up)),
        KeyCode::Down | KeyCode::Char('j') => Some(Msg::Navigate(DirectionKey::Down)),
        KeyCode::Left | KeyCode::Char('h') | KeyCode::PageUp => {
            Some(Msg::Page(DirectionKey::Left))
        }
        KeyCode::Right | KeyCode::Char('l') | KeyCode::PageDown => {
            Some(Msg::Page(DirectionKey::Right))
        }
        KeyCode::Char('c') => Some(Msg::Invoke(MessageAction::CopySql)),
        KeyCode::Char('r') => Some(Msg::Invoke(MessageAction::Run)),
        KeyCode::Char('n') => Some(Msg::Invoke(MessageAction::CycleLimit)),
        KeyCode::Char('m') => Some(Msg::Invoke(MessageAction::ChangeLimit)),
        KeyCode::Char('e') => Some(Msg::Invoke(MessageAction::ExportCsv)),
        KeyCode::Char('J') => Some(Msg::Invoke(MessageAction::ExportJson)),
        KeyCode::Char(digit @ '1'..='4') => digit
            .to_digit(10)
            .and_then(|digit| usize::try_from(digit).ok())
            .map(|digit| Msg::ChooseLimit(digit - 1)),
        KeyCode::Char('f') | KeyCode::Enter => Some(Msg::Invoke(MessageAction::FullScreen)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;
    use serde_json::json;
    use sqlchat_core::chat_session::{ChatSession, SessionOptions};
    use sqlchat_core::conversation_store::ConversationStore;
    use sqlchat_core::message::{Message, Row};
    use sqlchat_core::message_view::{MessageAction, PresentationVariant};
    use sqlchat_core::text2sql::{
        GenerationBackend, GenerationError, GenerationMode, Text2SqlRequest, Text2SqlResponse,
    };
    use tempfile::TempDir;
    use tokio::runtime::Runtime;
    use tokio::sync::Notify;

    use super::{
        map_key_event, osc52_sequence, render, ChatScreenOptions, DirectionKey, Focus, Msg,
        TuiApp,
    };

    /// Answers every prompt with `SELECT n FROM numbers` and, when asked to
    /// run, returns `limit` rows. Runs wait on `run_gate` when it is set.
    #[derive(Default)]
    struct NumbersBackend {
        requests: Mutex<Vec<Text2SqlRequest>>,
        run_gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl GenerationBackend for NumbersBackend {
        async fn generate_sql(
            &self,
            request: &Text2SqlRequest,
        ) -> Result<Text2SqlResponse, GenerationError> {
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            if let (true, Some(gate)) = (request.wants_results(), &self.run_gate) {
                gate.notified().await;
            }
            let results = request.wants_results().then(|| {
                (0..request.limit.unwrap_or(1))
                    .map(|n| json!({"n": n}).as_object().cloned().expect("object row"))
                    .collect::<Vec<Row>>()
            });
            Ok(Text2SqlResponse {
                output: Some("SELECT n FROM numbers".to_string()),
                explanation: "Lists numbers".to_string(),
                results,
                conversation_id: Some("conv-1".to_string()),
                ..Text2SqlResponse::default()
            })
        }
    }

    struct Harness {
        runtime: Runtime,
        export_dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                runtime: tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                    .expect("failed to build runtime"),
                export_dir: TempDir::new().expect("failed to create temp dir"),
            }
        }

        fn app(&self, variant: PresentationVariant) -> TuiApp<NumbersBackend> {
            self.app_with(variant, NumbersBackend::default())
        }

        fn app_with(
            &self,
            variant: PresentationVariant,
            backend: NumbersBackend,
        ) -> TuiApp<NumbersBackend> {
            let session = Arc::new(ChatSession::new(
                Arc::new(ConversationStore::in_memory()),
                backend,
                SessionOptions {
                    connection_id: None,
                    run_on_send: variant.runs_on_send(),
                },
            ));
            TuiApp::new(
                session,
                self.runtime.handle().clone(),
                ChatScreenOptions {
                    variant,
                    page_size: 2,
                    export_dir: self.export_dir.path().to_path_buf(),
                },
            )
        }
    }

    impl TuiApp<NumbersBackend> {
        fn wait_for_outcome(&mut self) {
            if let Some(outcome) = self.runtime.block_on(self.outcomes_rx.recv()) {
                self.apply_outcome(outcome);
            }
        }

        fn type_text(&mut self, text: &str) {
            for character in text.chars() {
                self.handle(Msg::Input(character));
            }
        }

        fn requests(&self) -> Vec<Text2SqlRequest> {
            self.session
                .client()
                .backend()
                .requests
                .lock()
                .expect("requests lock")
                .clone()
        }
    }

    fn seed_assistant(app: &TuiApp<NumbersBackend>, rows: usize, limit: u32) {
        let mut message = Message::assistant("Lists numbers");
        message.sql = Some("SELECT n FROM numbers".to_string());
        message.results = Some(
            (0..rows)
                .map(|n| json!({"n": n}).as_object().cloned().expect("object row"))
                .collect(),
        );
        message.results_limit = Some(limit);
        app.session.store().add_message(Message::user("numbers"));
        app.session.store().add_message(message);
    }

    #[test]
    fn keymap_routes_characters_by_focus() {
        let key = KeyEvent::new(KeyCode::Char('r'), KeyModifiers::NONE);
        assert_eq!(map_key_event(key, Focus::Input), Some(Msg::Input('r')));
        assert_eq!(
            map_key_event(key, Focus::Messages),
            Some(Msg::Invoke(MessageAction::Run))
        );
    }

    #[test]
    fn keymap_binds_limit_choices_and_json_export() {
        let four = KeyEvent::new(KeyCode::Char('4'), KeyModifiers::NONE);
        assert_eq!(map_key_event(four, Focus::Messages), Some(Msg::ChooseLimit(3)));
        assert_eq!(map_key_event(four, Focus::Input), Some(Msg::Input('4')));
        assert_eq!(
            map_key_event(
                KeyEvent::new(KeyCode::Char('1'), KeyModifiers::NONE),
                Focus::Messages
            ),
            Some(Msg::ChooseLimit(0))
        );
        assert_eq!(
            map_key_event(
                KeyEvent::new(KeyCode::Char('5'), KeyModifiers::NONE),
                Focus::Messages
            ),
            None
        );
        assert_eq!(
            map_key_event(
                KeyEvent::new(KeyCode::Char('J'), KeyModifiers::SHIFT),
                Focus::Messages
            ),
            Some(Msg::Invoke(MessageAction::ExportJson))
        );
    }

    #[test]
    fn keymap_supports_global_keys() {
        assert_eq!(
            map_key_event(
                KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
                Focus::Input
            ),
            Some(Msg::Quit)
        );
        assert_eq!(
            map_key_event(
                KeyEvent::new(KeyCode::Char('o'), KeyModifiers::CONTROL),
                Focus::Messages
            ),
            Some(Msg::ToggleMode)
        );
        assert_eq!(
            map_key_event(KeyEvent::new(KeyCode::Tab, KeyModifiers::NONE), Focus::Input),
            Some(Msg::ToggleFocus)
        );
        assert_eq!(
            map_key_event(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE), Focus::Input),
            Some(Msg::Submit)
        );
    }

    #[test]
    fn osc52_sequence_encodes_text() {
        assert_eq!(osc52_sequence("SELECT 1"), "\x1b]52;c;U0VMRUNUIDE=\x07");
    }

    #[test]
    fn submitting_prompt_appends_reply_and_selects_it() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Compact);

        app.type_text("  list numbers ");
        app.handle(Msg::Submit);
        assert!(app.input.is_empty());
        app.wait_for_outcome();

        let messages = app.session.store().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sql.as_deref(), Some("SELECT n FROM numbers"));
        assert_eq!(app.selected, Some(1));
        assert_eq!(app.status_line, "SQL generated");

        let requests = app.requests();
        assert_eq!(requests[0].prompt, "list numbers");
        assert_eq!(requests[0].run_query, Some(false));
    }

    #[test]
    fn empty_prompt_is_not_sent() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);

        app.type_text("   ");
        app.handle(Msg::Submit);
        assert!(app.requests().is_empty());
        assert_eq!(app.status_line, "Type a question first");
    }

    #[test]
    fn mode_toggle_updates_store() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);

        app.handle(Msg::ToggleMode);
        assert_eq!(app.session.store().mode(), GenerationMode::OneShot);
        assert!(app.status_line.starts_with("One-shot mode"));
    }

    #[test]
    fn compact_run_and_limit_cycle_update_message_in_place() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Compact);
        seed_assistant(&app, 0, 100);
        app.handle(Msg::ToggleFocus);
        assert_eq!(app.selected, Some(1));

        app.handle(Msg::Invoke(MessageAction::CycleLimit));
        assert_eq!(app.session.store().limit(), 250);
        app.handle(Msg::Invoke(MessageAction::CycleLimit));
        assert_eq!(app.session.store().limit(), 1);

        app.handle(Msg::Invoke(MessageAction::Run));
        app.wait_for_outcome();

        let messages = app.session.store().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].results.as_ref().map(Vec::len), Some(1));
        assert_eq!(app.status_line, "Query returned 1 rows");
        let requests = app.requests();
        assert_eq!(requests[0].prompt, "SELECT n FROM numbers");
        assert_eq!(requests[0].limit, Some(1));
    }

    #[test]
    fn truncated_table_loads_next_limit() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 100, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::Invoke(MessageAction::ChangeLimit));
        app.wait_for_outcome();

        let requests = app.requests();
        assert_eq!(requests[0].limit, Some(500));
        assert_eq!(requests[0].run_query, Some(true));
        let messages = app.session.store().messages();
        assert_eq!(messages[1].results.as_ref().map(Vec::len), Some(500));
        assert_eq!(messages[1].results_limit, Some(500));
        assert_eq!(app.session.store().limit(), 500);
    }

    #[test]
    fn truncated_table_reruns_with_chosen_limit() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 100, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::ChooseLimit(3));
        app.wait_for_outcome();

        let requests = app.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].limit, Some(5000));
        assert_eq!(requests[0].run_query, Some(true));
        let messages = app.session.store().messages();
        assert_eq!(messages[1].results.as_ref().map(Vec::len), Some(5000));
        assert_eq!(messages[1].results_limit, Some(5000));
    }

    #[test]
    fn limit_choice_needs_a_truncated_table() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 3, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::ChooseLimit(1));
        assert!(app.requests().is_empty());
        assert_eq!(app.status_line, "More rows is not available for this message");
    }

    #[test]
    fn prompt_and_mode_stay_available_while_a_run_is_pending() {
        let harness = Harness::new();
        let gate = Arc::new(Notify::new());
        let mut app = harness.app_with(
            PresentationVariant::Compact,
            NumbersBackend {
                run_gate: Some(Arc::clone(&gate)),
                ..NumbersBackend::default()
            },
        );
        seed_assistant(&app, 0, 100);
        app.handle(Msg::ToggleFocus);
        app.handle(Msg::Invoke(MessageAction::Run));
        while !app.session.is_loading() {
            std::thread::yield_now();
        }
        assert!(!app.session.is_sending());

        app.handle(Msg::ToggleMode);
        assert_eq!(app.session.store().mode(), GenerationMode::OneShot);

        app.handle(Msg::ToggleFocus);
        app.type_text("count numbers");
        app.handle(Msg::Submit);
        assert!(app.input.is_empty());
        app.wait_for_outcome();
        assert_eq!(app.status_line, "SQL generated");
        assert_eq!(app.session.store().messages().len(), 4);

        gate.notify_one();
        app.wait_for_outcome();
        assert_eq!(app.status_line, "Query returned 100 rows");
        let requests = app.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].prompt, "count numbers");
    }

    #[test]
    fn unavailable_action_reports_status() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 3, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::Invoke(MessageAction::ChangeLimit));
        assert!(app.requests().is_empty());
        assert_eq!(app.status_line, "More rows is not available for this message");
    }

    #[test]
    fn copy_and_export_use_selected_message() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 3, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::Invoke(MessageAction::CopySql));
        assert_eq!(app.take_clipboard().as_deref(), Some("SELECT n FROM numbers"));

        app.handle(Msg::Invoke(MessageAction::ExportCsv));
        let exported = std::fs::read_to_string(harness.export_dir.path().join("query-results.csv"))
            .expect("export file should exist");
        assert_eq!(exported, "n\n0\n1\n2");

        app.handle(Msg::Invoke(MessageAction::ExportJson));
        let exported = std::fs::read_to_string(harness.export_dir.path().join("query-results.json"))
            .expect("json export file should exist");
        let parsed: serde_json::Value = serde_json::from_str(&exported).expect("valid json");
        assert_eq!(parsed, json!([{"n": 0}, {"n": 1}, {"n": 2}]));
        assert!(app.status_line.starts_with("Exported 3 rows"));
    }

    #[test]
    fn full_screen_pages_are_clamped() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 3, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::Invoke(MessageAction::FullScreen));
        app.handle(Msg::Page(DirectionKey::Right));
        app.handle(Msg::Page(DirectionKey::Right));
        assert_eq!(app.full_screen.as_ref().map(|view| view.page), Some(1));

        app.handle(Msg::Close);
        assert!(app.full_screen.is_none());
    }

    #[test]
    fn clearing_history_resets_selection() {
        let harness = Harness::new();
        let mut app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 3, 100);
        app.handle(Msg::ToggleFocus);

        app.handle(Msg::ClearHistory);
        assert!(app.session.store().messages().is_empty());
        assert!(app.selected.is_none());
        app.handle(Msg::Invoke(MessageAction::Run));
        assert_eq!(app.status_line, "Select a message with SQL first");
    }

    #[test]
    fn renders_conversation_with_results() {
        let harness = Harness::new();
        let app = harness.app(PresentationVariant::Table);
        seed_assistant(&app, 3, 3);

        let mut terminal = Terminal::new(TestBackend::new(120, 40)).expect("terminal");
        terminal
            .draw(|frame| render(frame, &app))
            .expect("draw failed");
        let screen = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(ratatui::buffer::Cell::symbol)
            .collect::<String>();

        assert!(screen.contains("Assistant"));
        assert!(screen.contains("SELECT n FROM numbers"));
        assert!(screen.contains("Query results (3 rows found)"));
        assert!(screen.contains("Results may be truncated"));
    }
}
