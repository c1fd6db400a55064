//! Serial transport: port discovery, opening with the reader's line settings,
//! and a background thread that forwards received bytes to the event loop.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::Result;

/// Read timeout of opened ports; keeps the reader thread responsive.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|port| port.port_name).collect())
}

/// Opens `name` with 8 data bits, no parity, one stop bit and no flow control.
pub fn open(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()?;
    debug!("Opened {} at {} baud", name, baud_rate);
    Ok(port)
}

/// Handle to a running reader thread.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ReaderHandle {
    /// Asks the thread to finish and waits for it, releasing its port handle.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread.join().is_err() {
            error!("Serial reader thread panicked");
        }
    }

    #[cfg(test)]
    fn join(self) {
        let _ = self.thread.join();
    }
}

/// Spawns a thread reading from `port`. Every non-empty chunk is passed
/// through `wrap` and sent on `sender`. The thread ends when stopped, when the
/// receiver is dropped, or when the port fails with anything but a timeout.
pub fn spawn_reader<R, T, F>(mut port: R, sender: Sender<T>, wrap: F) -> ReaderHandle
where
    R: Read + Send + 'static,
    T: Send + 'static,
    F: Fn(Vec<u8>) -> T + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let thread = thread::spawn(move || {
        let mut serial_buf: Vec<u8> = vec![0; 128];
        while !stop_flag.load(Ordering::Relaxed) {
            match port.read(serial_buf.as_mut_slice()) {
                Ok(0) => thread::sleep(READ_TIMEOUT),
                Ok(bytes_read) => {
                    if sender.send(wrap(serial_buf[..bytes_read].to_vec())).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    error!("Serial port error: {}", e);
                    break;
                }
            }
        }
        debug!("Serial reader stopped");
    });
    ReaderHandle { stop, thread }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Replays scripted reads, then reports a broken pipe.
    struct Script(Vec<io::Result<Vec<u8>>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            let bytes = self.0.remove(0)?;
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }
    }

    #[test]
    fn reader_forwards_chunks_and_skips_timeouts() {
        let script = Script(vec![
            Ok(b"@scan_well 0 0 ".to_vec()),
            Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
            Ok(b"5\n".to_vec()),
        ]);
        let (tx, rx) = mpsc::channel();

        spawn_reader(script, tx, |bytes| bytes).join();

        let received: Vec<Vec<u8>> = rx.iter().collect();
        assert_eq!(received, vec![b"@scan_well 0 0 ".to_vec(), b"5\n".to_vec()]);
    }

    /// Never yields data, like an idle port.
    struct Idle;

    impl Read for Idle {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
        }
    }

    #[test]
    fn stop_ends_idle_reader() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        spawn_reader(Idle, tx, |bytes| bytes).stop();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn reader_stops_when_receiver_hangs_up() {
        let script = Script(vec![Ok(b"a".to_vec()), Ok(b"b".to_vec())]);
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        drop(rx);

        // Returns instead of spinning on the closed channel.
        spawn_reader(script, tx, |bytes| bytes).join();
    }
}
