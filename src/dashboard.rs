//! Full-screen terminal view: the plate grid, a selection cursor and a live
//! log pane fed by the `log` facade.

use crate::{attach, detach, ReaderSession};
use anyhow::Result;
use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use log::{error, info, LevelFilter, Log, Metadata, Record};
use plate_reader::link::{self, ReaderHandle};
use plate_reader::{Well, COLUMNS, ROWS};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::{Frame, Terminal};
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const LOG_CAPACITY: usize = 500;

static LOG_LINES: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn log_lines() -> &'static Mutex<VecDeque<String>> {
    LOG_LINES.get_or_init(|| Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)))
}

/// Appends every record to the on-screen log pane.
struct PaneLogger;

impl Log for PaneLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut lines) = log_lines().lock() {
            if lines.len() == LOG_CAPACITY {
                lines.pop_front();
            }
            lines.push_back(format!("{:<5} {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: PaneLogger = PaneLogger;

pub fn install_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

struct Dashboard {
    session: ReaderSession,
    reader: Option<ReaderHandle>,
    baud_rate: u32,
    cursor: (usize, usize),
    selected: BTreeSet<Well>,
}

impl Dashboard {
    fn cursor_well(&self) -> Option<Well> {
        Well::new(self.cursor.0, self.cursor.1).ok()
    }

    fn move_cursor(&mut self, d_row: isize, d_column: isize) {
        let row = (self.cursor.0 as isize + d_row).clamp(0, ROWS as isize - 1);
        let column = (self.cursor.1 as isize + d_column).clamp(0, COLUMNS as isize - 1);
        self.cursor = (row as usize, column as usize);
    }

    fn toggle_selection(&mut self) {
        if let Some(well) = self.cursor_well() {
            if !self.selected.remove(&well) {
                self.selected.insert(well);
            }
        }
    }

    // Mirrors the Connection menu: cycles to the next available port.
    fn next_port(&mut self, sender: &mpsc::Sender<Vec<u8>>) {
        let ports = match link::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                error!("Could not enumerate serial ports: {}", e);
                return;
            }
        };
        if ports.is_empty() {
            error!("No serial ports found");
            return;
        }
        let next = match self.session.port_name() {
            Some(current) => ports
                .iter()
                .position(|p| p == current)
                .map_or(0, |i| (i + 1) % ports.len()),
            None => 0,
        };
        let name = ports[next].clone();
        if let Err(e) = attach(
            &mut self.session,
            &mut self.reader,
            &name,
            self.baud_rate,
            sender.clone(),
            |bytes| bytes,
        ) {
            error!("{:#}", e);
        }
    }

    /// Returns false when the user asked to quit.
    fn handle_key(&mut self, code: KeyCode, sender: &mpsc::Sender<Vec<u8>>) -> bool {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return false,
            KeyCode::Up => self.move_cursor(-1, 0),
            KeyCode::Down => self.move_cursor(1, 0),
            KeyCode::Left => self.move_cursor(0, -1),
            KeyCode::Right => self.move_cursor(0, 1),
            KeyCode::Char(' ') => self.toggle_selection(),
            KeyCode::Char('p') => self.next_port(sender),
            KeyCode::Char('c') => self.session.clear_data(),
            KeyCode::Char('h') => report(self.session.home()),
            KeyCode::Char('e') => report(self.session.eject()),
            KeyCode::Char('a') => report(self.session.read_all()),
            KeyCode::Char('r') => {
                let wells: Vec<Well> = if self.selected.is_empty() {
                    self.cursor_well().into_iter().collect()
                } else {
                    self.selected.iter().copied().collect()
                };
                report(self.session.read_wells(&wells));
            }
            _ => (),
        }
        true
    }

    fn draw(&self, frame: &mut Frame) {
        let areas = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(ROWS as u16 + 3),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(frame.size());

        let plate = self.session.plate();
        let header = Row::new(
            std::iter::once(Cell::from(""))
                .chain((1..=COLUMNS).map(|c| Cell::from(c.to_string()))),
        )
        .style(Style::default().add_modifier(Modifier::BOLD));
        let rows = (0..ROWS).map(|row| {
            let label = Cell::from(((b'A' + row as u8) as char).to_string())
                .style(Style::default().add_modifier(Modifier::BOLD));
            let cells = Well::all().filter(|w| w.row() == row).map(|well| {
                let text = plate
                    .latest(well)
                    .map_or_else(|| String::from("·"), |v| v.to_string());
                let mut style = Style::default();
                if self.selected.contains(&well) {
                    style = style.add_modifier(Modifier::UNDERLINED);
                }
                if self.cursor == (well.row(), well.column()) {
                    style = style.add_modifier(Modifier::REVERSED);
                }
                Cell::from(text).style(style)
            });
            Row::new(std::iter::once(label).chain(cells))
        });
        let widths = std::iter::once(Constraint::Length(2))
            .chain(std::iter::repeat(Constraint::Min(6)).take(COLUMNS));
        let title = match self.session.port_name() {
            Some(name) => format!(" Plate ({}) ", name),
            None => String::from(" Plate (not connected) "),
        };
        let table = Table::new(rows, widths)
            .header(header)
            .block(Block::default().borders(Borders::ALL).title(title));
        frame.render_widget(table, areas[0]);

        let visible = areas[1].height.saturating_sub(2) as usize;
        let lines: Vec<Line> = match log_lines().lock() {
            Ok(log) => log
                .iter()
                .skip(log.len().saturating_sub(visible))
                .map(|l| Line::from(l.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };
        let log_pane = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Log "));
        frame.render_widget(log_pane, areas[1]);

        let help = Paragraph::new(
            "arrows move  space select  r read  a read all  h home  e eject  c clear  p port  q quit",
        );
        frame.render_widget(help, areas[2]);
    }
}

fn report(result: plate_reader::Result<()>) {
    match result {
        // Logged by the session.
        Ok(()) | Err(plate_reader::Error::NotConnected) => (),
        Err(e) => error!("{}", e),
    }
}

pub fn run(session: ReaderSession, port: Option<String>, baud_rate: u32) -> Result<()> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let mut dashboard = Dashboard {
        session,
        reader: None,
        baud_rate,
        cursor: (0, 0),
        selected: BTreeSet::new(),
    };
    match port {
        Some(name) => {
            if let Err(e) = attach(
                &mut dashboard.session,
                &mut dashboard.reader,
                &name,
                baud_rate,
                tx.clone(),
                |bytes| bytes,
            ) {
                error!("{:#}", e);
            }
        }
        None => info!("No port selected, press 'p' to pick one"),
    }

    let result = with_terminal(|terminal| event_loop(terminal, &mut dashboard, &tx, &rx));
    detach(&mut dashboard.session, &mut dashboard.reader);
    result
}

/// Restores the terminal when dropped, including on early error returns.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let guard = TerminalGuard;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    }
}

fn with_terminal<F>(body: F) -> Result<()>
where
    F: FnOnce(&mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()>,
{
    let _guard = TerminalGuard::enter()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
    body(&mut terminal)
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    dashboard: &mut Dashboard,
    tx: &mpsc::Sender<Vec<u8>>,
    rx: &Receiver<Vec<u8>>,
) -> Result<()> {
    loop {
        while let Ok(bytes) = rx.try_recv() {
            dashboard.session.receive(&bytes);
        }
        dashboard.session.poll(Instant::now());

        terminal.draw(|frame| dashboard.draw(frame))?;

        if event::poll(Duration::from_millis(50))? {
            if let TermEvent::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && !dashboard.handle_key(key.code, tx) {
                    return Ok(());
                }
            }
        }
    }
}
