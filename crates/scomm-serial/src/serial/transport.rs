//! Device transport abstraction.
//!
//! The terminal core talks to the device only through [`SerialTransport`].
//! [`SystemTransport`](crate::serial::system::SystemTransport) drives a real
//! port; [`SimulatedTransport`] is an in-memory device for tests and demos.

use crate::serial::error::{CloseError, LineError, OpenError, ReadError, WriteError};
use crate::serial::types::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Byte-stream device handle.
///
/// Implementations must be `Send + Sync` so one handle can be shared by
/// the receive loop and every sender.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    /// Open the device (8N1) and apply any control lines the config sets.
    async fn open(&self, config: &DeviceConfig) -> Result<(), OpenError>;

    /// Release the device. Closing an already-closed handle is a no-op.
    async fn close(&self) -> Result<(), CloseError>;

    /// Return whatever is buffered, waiting at most `max_wait` for the
    /// first byte. A timeout yields an empty vector, not an error. A device
    /// may bound the wait by a timeout fixed at open instead.
    async fn read_available(&self, max_wait: Duration) -> Result<Vec<u8>, ReadError>;

    /// Write `data`, returning how many bytes the device accepted. Callers
    /// do not retry the remainder.
    async fn write(&self, data: &[u8]) -> Result<usize, WriteError>;

    /// Drive an output control line.
    async fn set_line(&self, line: ControlLine, state: bool) -> Result<(), LineError>;

    fn is_open(&self) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport useful for unit tests and demos.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<VecDeque<u8>>,
    lines: Mutex<ControlLines>,
    line_log: Mutex<Vec<(ControlLine, bool)>>,
    rx_notify: Notify,
    loopback: AtomicBool,
    fail_open: Mutex<Option<OpenError>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_limit: Mutex<Option<usize>>,
}

impl SimulatedTransport {
    /// Create a new simulated transport for the given port name.
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            lines: Mutex::new(ControlLines::default()),
            line_log: Mutex::new(Vec::new()),
            rx_notify: Notify::new(),
            loopback: AtomicBool::new(false),
            fail_open: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            write_limit: Mutex::new(None),
        })
    }

    /// Enable loopback mode (TX data is immediately available in RX).
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Inject bytes into the receive buffer (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        buf.drain(..).collect()
    }

    /// Make the next `open` fail with `err`.
    pub async fn fail_next_open(&self, err: OpenError) {
        *self.fail_open.lock().await = Some(err);
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail until cleared.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Accept at most `limit` bytes per write (simulates a full buffer).
    pub async fn set_write_limit(&self, limit: Option<usize>) {
        *self.write_limit.lock().await = limit;
    }

    /// Current output line states.
    pub async fn lines(&self) -> ControlLines {
        *self.lines.lock().await
    }

    /// Every `set_line` call in order, including those made on open.
    pub async fn line_log(&self) -> Vec<(ControlLine, bool)> {
        self.line_log.lock().await.clone()
    }

    async fn record_line(&self, line: ControlLine, state: bool) {
        self.lines.lock().await.set(line, state);
        self.line_log.lock().await.push((line, state));
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, config: &DeviceConfig) -> Result<(), OpenError> {
        if let Some(err) = self.fail_open.lock().await.take() {
            return Err(err);
        }
        if self.open.load(Ordering::SeqCst) {
            return Err(OpenError::AlreadyOpen(self.name.clone()));
        }
        self.open.store(true, Ordering::SeqCst);

        if let Some(rts) = config.control_lines.rts {
            self.record_line(ControlLine::Rts, rts).await;
        }
        if let Some(dtr) = config.control_lines.dtr {
            self.record_line(ControlLine::Dtr, dtr).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CloseError> {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }

    async fn read_available(&self, max_wait: Duration) -> Result<Vec<u8>, ReadError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReadError::NotOpen);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ReadError::Device("simulated read failure".into()));
        }
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            // Register before releasing the lock so an inject in between
            // still wakes us.
            let notified = self.rx_notify.notified();
            drop(rx);
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(max_wait) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        Ok(rx.drain(..).collect())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(WriteError::NotOpen);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WriteError::DeviceError("simulated write failure".into()));
        }
        let accepted = match *self.write_limit.lock().await {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        let chunk = &data[..accepted];
        self.tx_buf.lock().await.extend(chunk);

        if self.loopback.load(Ordering::SeqCst) {
            self.inject_rx(chunk).await;
        }
        Ok(accepted)
    }

    async fn set_line(&self, line: ControlLine, state: bool) -> Result<(), LineError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(LineError::NotOpen);
        }
        self.record_line(line, state).await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Formatting helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert bytes to an uppercase, space-separated hex string.
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
