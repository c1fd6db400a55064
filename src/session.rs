//! The reader session: owns the optional port, turns user actions into
//! commands, and applies the device's replies to the results grid.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::plate::{Plate, Well};
use crate::protocol::{Command, LineFramer, Reply, ReplyError};

/// Something the session observed while processing input.
#[derive(Debug, PartialEq)]
pub enum Event {
    WellRead { well: Well, intensity: i64 },
    Homed,
    /// The device did not confirm `home` in time.
    HomeTimedOut,
    Unrecognized(String),
    Malformed(ReplyError),
}

struct Connection<P> {
    name: String,
    port: P,
}

pub struct Session<P: Write> {
    config: DeviceConfig,
    connection: Option<Connection<P>>,
    framer: LineFramer,
    plate: Plate,
    home_deadline: Option<Instant>,
}

impl<P: Write> Session<P> {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            connection: None,
            framer: LineFramer::new(),
            plate: Plate::new(),
            home_deadline: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn plate(&self) -> &Plate {
        &self.plate
    }

    /// Adopts an opened port, dropping any previous one.
    pub fn connect(&mut self, name: impl Into<String>, port: P) {
        let name = name.into();
        info!("Comport {} connected", name);
        self.connection = Some(Connection { name, port });
        self.framer = LineFramer::new();
    }

    pub fn disconnect(&mut self) -> Option<P> {
        let connection = self.connection.take()?;
        info!("Comport {} disconnected", connection.name);
        self.home_deadline = None;
        Some(connection.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.name.as_str())
    }

    pub fn port(&self) -> Option<&P> {
        self.connection.as_ref().map(|c| &c.port)
    }

    pub fn is_homing(&self) -> bool {
        self.home_deadline.is_some()
    }

    /// Writes one framed command and flushes the port.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        let frame = command.encode();
        debug!("Comport send: {}", frame.trim_end());
        let Some(connection) = self.connection.as_mut() else {
            error!("Comport not connected");
            return Err(Error::NotConnected);
        };
        connection.port.write_all(frame.as_bytes())?;
        connection.port.flush()?;
        Ok(())
    }

    pub fn home(&mut self) -> Result<()> {
        self.home_at(Instant::now())
    }

    /// Sends `home` and arms the home timeout from `now`.
    pub fn home_at(&mut self, now: Instant) -> Result<()> {
        if self.is_homing() {
            return Err(Error::HomeInProgress);
        }
        self.send(&Command::Home)?;
        self.home_deadline = Some(now + self.config.serial.home_timeout());
        Ok(())
    }

    /// Drives the tray to the configured open position.
    pub fn eject(&mut self) -> Result<()> {
        self.send(&Command::MoveAbs(self.config.open_position))
    }

    pub fn move_abs(&mut self, position: i32) -> Result<()> {
        self.send(&Command::MoveAbs(position))
    }

    fn write_settings(&mut self) -> Result<()> {
        let rows = Command::SetRowPositions(self.config.row_positions.clone());
        let leds = Command::SetLedPower(self.config.led_intensities.clone());
        self.send(&rows)?;
        self.send(&leds)
    }

    /// Writes the row and LED settings, then scans `wells` in order.
    pub fn read_wells(&mut self, wells: &[Well]) -> Result<()> {
        self.write_settings()?;
        for &well in wells {
            self.send(&Command::ScanWell(well))?;
        }
        Ok(())
    }

    pub fn read_all(&mut self) -> Result<()> {
        self.write_settings()?;
        self.send(&Command::ScanAll)
    }

    pub fn clear_data(&mut self) {
        self.plate.clear();
        info!("Data cleared");
    }

    /// Feeds bytes read from the port and applies every completed reply.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Event> {
        let lines = self.framer.push(bytes);
        lines
            .into_iter()
            .map(|line| {
                let reply = line.and_then(|line| {
                    debug!("{}", line);
                    Reply::parse(&line)
                });
                self.apply(reply)
            })
            .collect()
    }

    fn apply(&mut self, reply: std::result::Result<Reply, ReplyError>) -> Event {
        match reply {
            Ok(Reply::ScanWell { well, intensity }) => {
                self.plate.record(well, intensity);
                Event::WellRead { well, intensity }
            }
            Ok(Reply::Home) => {
                self.home_deadline = None;
                info!("Device homed");
                Event::Homed
            }
            Ok(Reply::Other(line)) => Event::Unrecognized(line),
            Err(e) => {
                warn!("Ignoring reply: {}", e);
                Event::Malformed(e)
            }
        }
    }

    /// Reports a home timeout once `now` passes the armed deadline.
    pub fn poll(&mut self, now: Instant) -> Option<Event> {
        match self.home_deadline {
            Some(deadline) if now >= deadline => {
                self.home_deadline = None;
                error!("Device home timeout");
                Some(Event::HomeTimedOut)
            }
            _ => None,
        }
    }

    /// Writes the averaged grid to `path` as CSV.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)?;
        self.plate.write_csv(BufWriter::new(file))?;
        info!("Exported {} samples to {}", self.plate.count(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> DeviceConfig {
        DeviceConfig::from_toml(
            "row_positions = [10, 20, 30, 40, 50, 60, 70, 80]\n\
             led_intensities = [90, 95]\n\
             open_position = 14000\n\
             [serial]\n\
             home_timeout_ms = 1000\n",
        )
        .unwrap()
    }

    fn connected() -> Session<Vec<u8>> {
        let mut session = Session::new(config());
        session.connect("COM3", Vec::new());
        session
    }

    fn sent(session: &Session<Vec<u8>>) -> String {
        String::from_utf8(session.port().unwrap().clone()).unwrap()
    }

    fn well(label: &str) -> Well {
        label.parse().unwrap()
    }

    #[test]
    fn new_session_is_disconnected() {
        let session: Session<Vec<u8>> = Session::new(config());
        assert!(!session.is_connected());
        assert_eq!(session.port_name(), None);
        assert_eq!(session.plate().count(), 0);
    }

    #[test]
    fn send_without_port_fails() {
        let mut session: Session<Vec<u8>> = Session::new(config());
        assert!(matches!(session.send(&Command::ScanAll), Err(Error::NotConnected)));
        assert!(matches!(session.home(), Err(Error::NotConnected)));
        assert!(!session.is_homing());
    }

    #[test]
    fn connect_records_port_name() {
        let session = connected();
        assert!(session.is_connected());
        assert_eq!(session.port_name(), Some("COM3"));
    }

    #[test]
    fn eject_moves_to_open_position() {
        let mut session = connected();
        session.eject().unwrap();
        assert_eq!(sent(&session), "/move_abs 14000\n");
    }

    #[test]
    fn move_abs_sends_position() {
        let mut session = connected();
        session.move_abs(-250).unwrap();
        assert_eq!(sent(&session), "/move_abs -250\n");
    }

    #[test]
    fn read_wells_writes_settings_first() {
        let mut session = connected();
        session.read_wells(&[well("A1"), well("C5")]).unwrap();
        assert_eq!(
            sent(&session),
            "/set_row_pos 10 20 30 40 50 60 70 80\n\
             /set_led_pwr 90 95\n\
             /scan_well 0 0\n\
             /scan_well 4 2\n"
        );
    }

    #[test]
    fn read_all_writes_settings_then_scan_all() {
        let mut session = connected();
        session.read_all().unwrap();
        assert_eq!(
            sent(&session),
            "/set_row_pos 10 20 30 40 50 60 70 80\n/set_led_pwr 90 95\n/scan_all\n"
        );
    }

    #[test]
    fn scan_replies_fill_the_plate() {
        let mut session = connected();
        let events = session.receive(b"@scan_well 4 2 100\n@scan_well 4 2 300\n");

        let c5 = well("C5");
        assert_eq!(
            events,
            vec![
                Event::WellRead { well: c5, intensity: 100 },
                Event::WellRead { well: c5, intensity: 300 },
            ]
        );
        assert_eq!(session.plate().samples(c5), &[100, 300]);
        assert_eq!(session.plate().latest(c5), Some(300));
    }

    #[test]
    fn replies_split_across_reads() {
        let mut session = connected();
        assert!(session.receive(b"@scan_well 11 ").is_empty());
        let events = session.receive(b"7 42\r\n");
        assert_eq!(events, vec![Event::WellRead { well: well("H12"), intensity: 42 }]);
    }

    #[test]
    fn malformed_reply_does_not_stop_processing() {
        let mut session = connected();
        let events = session.receive(b"@scan_well 99 0 1\nhello\n@scan_well 0 0 1\n");
        assert!(matches!(events[0], Event::Malformed(ReplyError::InvalidWell(_))));
        assert_eq!(events[1], Event::Unrecognized(String::from("hello")));
        assert_eq!(events[2], Event::WellRead { well: well("A1"), intensity: 1 });
        assert_eq!(session.plate().count(), 1);
    }

    #[test]
    fn clear_data_empties_plate() {
        let mut session = connected();
        session.receive(b"@scan_well 0 0 1\n@scan_well 1 0 2\n");
        session.clear_data();
        assert_eq!(session.plate().count(), 0);
    }

    #[test]
    fn home_blocks_until_device_confirms() {
        let mut session = connected();
        let start = Instant::now();
        session.home_at(start).unwrap();
        assert!(session.is_homing());
        assert!(matches!(session.home_at(start), Err(Error::HomeInProgress)));
        assert_eq!(sent(&session), "/home\n");

        assert_eq!(session.receive(b"@home\n"), vec![Event::Homed]);
        assert!(!session.is_homing());
        assert_eq!(session.poll(start + Duration::from_secs(5)), None);

        session.home_at(start).unwrap();
        assert_eq!(sent(&session), "/home\n/home\n");
    }

    #[test]
    fn home_times_out_once() {
        let mut session = connected();
        let start = Instant::now();
        session.home_at(start).unwrap();

        assert_eq!(session.poll(start + Duration::from_millis(999)), None);
        assert_eq!(
            session.poll(start + Duration::from_millis(1000)),
            Some(Event::HomeTimedOut)
        );
        assert_eq!(session.poll(start + Duration::from_secs(10)), None);
        assert!(!session.is_homing());
    }

    #[test]
    fn disconnect_returns_port_and_cancels_home() {
        let mut session = connected();
        session.home().unwrap();
        let port = session.disconnect().unwrap();
        assert_eq!(port, b"/home\n".to_vec());
        assert!(!session.is_connected());
        assert!(!session.is_homing());
        assert!(session.disconnect().is_none());
    }

    #[test]
    fn reconnect_discards_partial_line() {
        let mut session = connected();
        session.receive(b"@scan_well 0 0");
        session.connect("COM4", Vec::new());
        assert_eq!(
            session.receive(b"@home\n"),
            vec![Event::Homed]
        );
        assert_eq!(session.port_name(), Some("COM4"));
    }

    #[test]
    fn oversized_garbage_line_records_nothing() {
        let mut session = connected();
        let mut bytes = vec![b'x'; crate::protocol::MAX_LINE_LEN];
        bytes.extend_from_slice(b"@scan_well 0 0 9\n");

        assert!(session.receive(&bytes).is_empty());
        assert_eq!(session.plate().count(), 0);

        let events = session.receive(b"@scan_well 0 0 9\n");
        assert_eq!(events, vec![Event::WellRead { well: well("A1"), intensity: 9 }]);
    }

    #[test]
    fn export_csv_writes_eight_rows() {
        let mut session = connected();
        session.receive(b"@scan_well 0 0 10\n@scan_well 0 0 20\n");

        let path = std::env::temp_dir().join(format!("plate-export-{}.csv", std::process::id()));
        session.export_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8);
        assert!(lines[0].starts_with("15,nan,"));
        assert!(lines.iter().all(|line| line.split(',').count() == 12));
    }
}
