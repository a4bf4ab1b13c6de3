//! [`SerialTransport`] backed by a real device through the `serialport`
//! crate.
//!
//! The port is split with `try_clone` into a reader and a writer handle so
//! a blocking read never holds up a write. All blocking calls run on
//! tokio's blocking pool.
//!
//! Clones share one OS timeout on some platforms, so the timeout is set
//! once at open (`read_timeout_ms`) and never changed afterwards. A write
//! retries timed-out attempts until `write_timeout_ms` has elapsed.

use crate::serial::error::{CloseError, LineError, OpenError, ReadError, WriteError};
use crate::serial::transport::SerialTransport;
use crate::serial::types::{ControlLine, DeviceConfig};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type PortSlot = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

const READ_CHUNK: usize = 4096;

pub struct SystemTransport {
    reader: PortSlot,
    writer: PortSlot,
    write_timeout: Mutex<Duration>,
    open: AtomicBool,
}

impl Default for SystemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTransport {
    pub fn new() -> Self {
        Self {
            reader: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            write_timeout: Mutex::new(Duration::from_millis(1000)),
            open: AtomicBool::new(false),
        }
    }

    fn write_timeout(&self) -> Duration {
        self.write_timeout
            .lock()
            .map(|d| *d)
            .unwrap_or(Duration::from_millis(1000))
    }
}

fn map_open_error(port: &str, err: serialport::Error) -> OpenError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => OpenError::DeviceNotFound(port.to_string()),
        serialport::ErrorKind::InvalidInput => OpenError::InvalidParameter(err.description),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            OpenError::DeviceNotFound(port.to_string())
        }
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            OpenError::DeviceBusy(port.to_string())
        }
        _ if err.description.to_ascii_lowercase().contains("busy") => {
            OpenError::DeviceBusy(port.to_string())
        }
        _ => OpenError::Io(err.description),
    }
}

/// Write once, retrying timed-out attempts until `deadline`. A failed
/// flush is logged; the bytes were already accepted.
fn write_within<W: Write + ?Sized>(
    port: &mut W,
    data: &[u8],
    deadline: Instant,
) -> Result<usize, WriteError> {
    loop {
        match port.write(data) {
            Ok(n) => {
                if let Err(e) = port.flush() {
                    log::warn!("Flush after write failed: {}", e);
                }
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if Instant::now() >= deadline {
                    return Err(WriteError::WriteTimeout { written: 0 });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WriteError::DeviceError(e.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl SerialTransport for SystemTransport {
    async fn open(&self, config: &DeviceConfig) -> Result<(), OpenError> {
        if self.open.load(Ordering::SeqCst) {
            return Err(OpenError::AlreadyOpen(config.port_name.clone()));
        }
        if config.port_name.is_empty() {
            return Err(OpenError::InvalidParameter("no port selected".into()));
        }
        if config.baud_rate.value() == 0 {
            return Err(OpenError::InvalidParameter("baud rate must be positive".into()));
        }

        let cfg = config.clone();
        let (reader, writer) = tokio::task::spawn_blocking(move || {
            let mut port = serialport::new(&cfg.port_name, cfg.baud_rate.value())
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(Duration::from_millis(cfg.read_timeout_ms))
                .open()
                .map_err(|e| map_open_error(&cfg.port_name, e))?;

            if let Some(rts) = cfg.control_lines.rts {
                port.write_request_to_send(rts)
                    .map_err(|e| OpenError::Io(e.to_string()))?;
            }
            if let Some(dtr) = cfg.control_lines.dtr {
                port.write_data_terminal_ready(dtr)
                    .map_err(|e| OpenError::Io(e.to_string()))?;
            }

            let reader = port
                .try_clone()
                .map_err(|e| OpenError::Io(format!("clone failed: {}", e)))?;
            Ok::<_, OpenError>((reader, port))
        })
        .await
        .map_err(|e| OpenError::Io(e.to_string()))??;

        let poisoned = |_| OpenError::Io("port lock poisoned".into());
        *self.reader.lock().map_err(poisoned)? = Some(reader);
        *self.writer.lock().map_err(poisoned)? = Some(writer);
        if let Ok(mut t) = self.write_timeout.lock() {
            *t = Duration::from_millis(config.write_timeout_ms);
        }
        self.open.store(true, Ordering::SeqCst);
        log::info!(
            "Opened {} at {}",
            config.port_name,
            config.shorthand()
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), CloseError> {
        self.open.store(false, Ordering::SeqCst);
        let poisoned = |_| CloseError::Device("port lock poisoned".into());
        // Dropping the boxes releases the OS handle. The reader may be in
        // the middle of a bounded read; that finishes within its timeout.
        let writer = self.writer.lock().map_err(poisoned)?.take();
        drop(writer);
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut slot) = reader.lock() {
                slot.take();
            }
        })
        .await
        .map_err(|e| CloseError::Device(e.to_string()))?;
        Ok(())
    }

    /// Waits at most the timeout configured at open, which the caller's
    /// `_max_wait` does not override.
    async fn read_available(&self, _max_wait: Duration) -> Result<Vec<u8>, ReadError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReadError::NotOpen);
        }
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = reader
                .lock()
                .map_err(|_| ReadError::Device("port lock poisoned".into()))?;
            let port = slot.as_mut().ok_or(ReadError::NotOpen)?;
            let mut buf = vec![0u8; READ_CHUNK];
            match port.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Vec::new()),
                Err(e) => Err(ReadError::Device(e.to_string())),
            }
        })
        .await
        .map_err(|e| ReadError::Device(e.to_string()))?
    }

    async fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(WriteError::NotOpen);
        }
        let writer = self.writer.clone();
        let timeout = self.write_timeout();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut slot = writer
                .lock()
                .map_err(|_| WriteError::DeviceError("port lock poisoned".into()))?;
            let port = slot.as_mut().ok_or(WriteError::NotOpen)?;
            write_within(&mut **port, &data, Instant::now() + timeout)
        })
        .await
        .map_err(|e| WriteError::DeviceError(e.to_string()))?
    }

    async fn set_line(&self, line: ControlLine, state: bool) -> Result<(), LineError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(LineError::NotOpen);
        }
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut slot = writer.lock().map_err(|_| LineError::Device {
                line: line.label(),
                reason: "port lock poisoned".into(),
            })?;
            let port = slot.as_mut().ok_or(LineError::NotOpen)?;
            let result = match line {
                ControlLine::Rts => port.write_request_to_send(state),
                ControlLine::Dtr => port.write_data_terminal_ready(state),
            };
            result.map_err(|e| LineError::Device {
                line: line.label(),
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| LineError::Device {
            line: line.label(),
            reason: e.to_string(),
        })?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_fail_before_open() {
        let t = SystemTransport::new();
        assert!(!t.is_open());
        assert!(matches!(
            t.read_available(Duration::from_millis(1)).await,
            Err(ReadError::NotOpen)
        ));
        assert!(matches!(t.write(b"x").await, Err(WriteError::NotOpen)));
        assert!(matches!(
            t.set_line(ControlLine::Rts, true).await,
            Err(LineError::NotOpen)
        ));
        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_rejects_empty_port_name() {
        let t = SystemTransport::new();
        let err = t.open(&DeviceConfig::default()).await.unwrap_err();
        assert!(matches!(err, OpenError::InvalidParameter(_)));
    }

    /// Times out `stalls` times, then accepts everything; flush may fail.
    struct StallingPort {
        stalls: usize,
        flush_fails: bool,
        written: Vec<u8>,
    }

    impl Write for StallingPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.stalls > 0 {
                self.stalls -= 1;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            if self.flush_fails {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_write_retries_until_deadline() {
        let mut port = StallingPort {
            stalls: 3,
            flush_fails: true,
            written: Vec::new(),
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(write_within(&mut port, b"AT", deadline).unwrap(), 2);
        assert_eq!(port.written, b"AT");

        let mut port = StallingPort {
            stalls: usize::MAX,
            flush_fails: false,
            written: Vec::new(),
        };
        let err = write_within(&mut port, b"AT", Instant::now()).unwrap_err();
        assert!(matches!(err, WriteError::WriteTimeout { written: 0 }));
        assert!(port.written.is_empty());
    }

    #[test]
    fn test_map_open_error() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            map_open_error("COM4", err),
            OpenError::DeviceNotFound(p) if p == "COM4"
        ));
        let err = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad baud");
        assert!(matches!(
            map_open_error("COM4", err),
            OpenError::InvalidParameter(_)
        ));
        let err = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "Access is denied.",
        );
        assert!(matches!(map_open_error("COM4", err), OpenError::DeviceBusy(_)));
        let err = serialport::Error::new(serialport::ErrorKind::Unknown, "Device or resource busy");
        assert!(matches!(map_open_error("COM4", err), OpenError::DeviceBusy(_)));
    }
}
