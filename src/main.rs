mod dashboard;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plate_reader::link::{self, ReaderHandle};
use plate_reader::{DeviceConfig, Error, Event, Session, Well, COLUMNS, DEFAULT_CONFIG_PATH};
use serialport::SerialPort;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) type ReaderSession = Session<Box<dyn SerialPort>>;

#[derive(Parser, Debug)]
#[command(about = "Host controller for the microplate reader")]
struct Args {
    /// Device configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Serial port to connect to at startup.
    #[arg(short, long)]
    port: Option<String>,
    /// Overrides the baud rate from the configuration.
    #[arg(short, long)]
    baud: Option<u32>,
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// List serial ports and exit.
    Ports,
    /// Line-oriented console (default).
    Console,
    /// Full-screen plate view with a live log pane.
    Dashboard,
}

// Everything the console loop waits on.
enum Input {
    Line(String),
    Serial(Vec<u8>),
    Eof,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mode = args.mode.unwrap_or(Mode::Console);

    if mode == Mode::Ports {
        return print_ports();
    }

    if mode == Mode::Dashboard {
        dashboard::install_logger();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = DeviceConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let baud_rate = args.baud.unwrap_or(config.serial.baud_rate);
    let session = Session::new(config);

    match mode {
        Mode::Dashboard => dashboard::run(session, args.port, baud_rate),
        _ => run_console(session, args.port, baud_rate),
    }
}

fn print_ports() -> Result<()> {
    let ports = link::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port);
    }
    Ok(())
}

/// Opens `name`, hands it to the session and starts forwarding its replies.
/// Any previous connection and its reader thread are shut down first.
pub(crate) fn attach<T, F>(
    session: &mut ReaderSession,
    reader: &mut Option<ReaderHandle>,
    name: &str,
    baud_rate: u32,
    sender: Sender<T>,
    wrap: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(Vec<u8>) -> T + Send + 'static,
{
    detach(session, reader);
    let port = link::open(name, baud_rate).with_context(|| format!("opening {}", name))?;
    let listener = port.try_clone().context("cloning port handle")?;
    *reader = Some(link::spawn_reader(listener, sender, wrap));
    session.connect(name, port);
    Ok(())
}

pub(crate) fn detach(session: &mut ReaderSession, reader: &mut Option<ReaderHandle>) {
    if let Some(handle) = reader.take() {
        handle.stop();
    }
    session.disconnect();
}

fn run_console(mut session: ReaderSession, port: Option<String>, baud_rate: u32) -> Result<()> {
    println!("==========================");
    println!("  Microplate Reader Host  ");
    println!("==========================");
    println!("Type 'help' for a list of commands.");

    let (tx, rx) = mpsc::channel();
    let mut reader = None;

    if let Some(name) = port {
        attach(&mut session, &mut reader, &name, baud_rate, tx.clone(), Input::Serial)?;
    }

    let stdin_tx = tx.clone();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if stdin_tx.send(Input::Line(line)).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = stdin_tx.send(Input::Eof);
    });

    prompt();
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Input::Line(line)) => {
                let command = line.trim();
                if command == "quit" || command == "exit" {
                    break;
                }
                if !command.is_empty() {
                    if let Err(e) = run_command(&mut session, &mut reader, baud_rate, &tx, command) {
                        eprintln!("[ERROR] {:#}", e);
                    }
                }
                prompt();
            }
            Ok(Input::Serial(bytes)) => {
                for event in session.receive(&bytes) {
                    display_event(&event);
                }
            }
            Ok(Input::Eof) => break,
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Some(event) = session.poll(Instant::now()) {
            display_event(&event);
        }
    }

    detach(&mut session, &mut reader);
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn display_event(event: &Event) {
    match event {
        Event::WellRead { well, intensity } => println!("< {} = {}", well, intensity),
        Event::Homed => println!("< homed"),
        Event::HomeTimedOut => println!("< home timed out"),
        Event::Unrecognized(line) => println!("< {}", line),
        // Already logged by the session.
        Event::Malformed(_) => (),
    }
}

// Handles one console line.
fn run_command(
    session: &mut ReaderSession,
    reader: &mut Option<ReaderHandle>,
    baud_rate: u32,
    tx: &Sender<Input>,
    line: &str,
) -> Result<()> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();

    let outcome = match verb {
        "help" => {
            print_help();
            Ok(())
        }
        "ports" => return print_ports(),
        "connect" => {
            let [name] = rest.as_slice() else {
                bail!("usage: connect <port>");
            };
            return attach(session, reader, name, baud_rate, tx.clone(), Input::Serial);
        }
        "disconnect" => {
            detach(session, reader);
            Ok(())
        }
        "home" => session.home(),
        "eject" => session.eject(),
        "move" => {
            let [position] = rest.as_slice() else {
                bail!("usage: move <position>");
            };
            let position: i32 = position
                .parse()
                .with_context(|| format!("invalid position '{}'", position))?;
            session.move_abs(position)
        }
        "read" => {
            if rest.is_empty() {
                bail!("usage: read <well>...");
            }
            let wells = rest
                .iter()
                .map(|label| label.parse::<Well>())
                .collect::<Result<Vec<_>, _>>()?;
            session.read_wells(&wells)
        }
        "read-all" => session.read_all(),
        "clear" => {
            session.clear_data();
            Ok(())
        }
        "show" => {
            print_plate(session);
            Ok(())
        }
        "export" => {
            let [path] = rest.as_slice() else {
                bail!("usage: export <path>");
            };
            session.export_csv(path)
        }
        _ => bail!("unknown command '{}', type 'help'", verb),
    };

    match outcome {
        // The session already logged it.
        Err(Error::NotConnected) => Ok(()),
        other => Ok(other?),
    }
}

fn print_help() {
    println!("  connect <port>     open a serial port");
    println!("  disconnect         close the serial port");
    println!("  ports              list serial ports");
    println!("  home               home the carriage");
    println!("  eject              move the tray to the open position");
    println!("  move <n>           move to absolute position n");
    println!("  read <well>...     scan wells, e.g. 'read A1 C5'");
    println!("  read-all           scan the whole plate");
    println!("  clear              discard all readings");
    println!("  show               print the latest reading of every well");
    println!("  export <path>      write per-well means as CSV");
    println!("  quit               leave");
}

fn print_plate(session: &ReaderSession) {
    let plate = session.plate();
    print!("   ");
    for column in 1..=COLUMNS {
        print!("{:>8}", column);
    }
    for well in Well::all() {
        if well.column() == 0 {
            print!("\n{:>3}", (b'A' + well.row() as u8) as char);
        }
        match plate.latest(well) {
            Some(value) => print!("{:>8}", value),
            None => print!("{:>8}", "-"),
        }
    }
    println!();
}
