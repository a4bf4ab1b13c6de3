//! Loop scheduling: receive loop, periodic send loop and port scan.
//!
//! Every loop owns a [`CancellationToken`] and selects on it at each
//! suspension point. Loop bodies catch, log and continue; only
//! cancellation ends a loop.

use crate::serial::coalescer::{Coalescer, ReceiveSettings};
use crate::serial::decode::DecodePipeline;
use crate::serial::error::{ReadError, TerminalError};
use crate::serial::outbound::{OutboundQueue, PayloadSource};
use crate::serial::transport::SerialTransport;
use crate::serial::types::*;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bounded wait for each read while the device is open.
pub const RX_WAIT: Duration = Duration::from_millis(50);
/// Pause after a chunk, bounding CPU use under a continuous stream.
pub const RX_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Pause while the device is closed or after a read error.
pub const RX_IDLE_INTERVAL: Duration = Duration::from_millis(200);
/// Default retry interval of the port scan.
pub const PORT_SCAN_RETRY: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Counters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lock-free statistics shared by the loops and the façade.
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub chunks_rx: AtomicU64,
    pub payloads_tx: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub build_errors: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            chunks_rx: self.chunks_rx.load(Ordering::Relaxed),
            payloads_tx: self.payloads_tx.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            build_errors: self.build_errors.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transmitter (shared send path)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which payload a send uses.
#[derive(Debug, Clone)]
pub enum SendRequest {
    /// Reuse the last build.
    Cached,
    /// Rebuild from `source` first and apply one-shot line overrides.
    Fresh {
        source: PayloadSource,
        overrides: ControlLines,
    },
}

/// The single send path used by interactive and periodic sends.
pub struct Transmitter {
    transport: Arc<dyn SerialTransport>,
    outbound: Arc<OutboundQueue>,
    session: Arc<RwLock<DeviceSession>>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    counters: Arc<Counters>,
    /// Held across build-then-write.
    send_lock: Mutex<()>,
    /// Sent bytes go to the receive loop so it stays the coalescer's only
    /// writer. `None` while no receive loop runs.
    mirror: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Transmitter {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        outbound: Arc<OutboundQueue>,
        session: Arc<RwLock<DeviceSession>>,
        events: mpsc::UnboundedSender<TerminalEvent>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            transport,
            outbound,
            session,
            events,
            counters,
            send_lock: Mutex::new(()),
            mirror: std::sync::Mutex::new(None),
        }
    }

    fn set_mirror(&self, tx: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        if let Ok(mut slot) = self.mirror.lock() {
            *slot = tx;
        }
    }

    fn status(&self, msg: StatusMessage) {
        let _ = self.events.send(TerminalEvent::Status(msg));
    }

    /// Block sends while the guard lives. Held across open until the
    /// receive loop is wired, so no write goes unmirrored.
    pub async fn hold_sends(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    /// Build (if needed) and write one payload. Returns the number of bytes
    /// the device accepted.
    pub async fn send(&self, request: SendRequest) -> Result<usize, TerminalError> {
        let _guard = self.send_lock.lock().await;
        if !self.transport.is_open() {
            return Err(TerminalError::NotOpen);
        }

        let built = match request {
            SendRequest::Cached => self.outbound.take(),
            SendRequest::Fresh { source, overrides } => self
                .outbound
                .prepare_fresh(source, overrides)
                .and_then(|_| self.outbound.take()),
        };
        let payload = match built {
            Ok(p) => p,
            Err(e) => {
                bump(&self.counters.build_errors, 1);
                log::warn!("Send skipped: {}", e);
                self.status(StatusMessage::warn(format!("Send skipped: {}", e)));
                return Err(e.into());
            }
        };

        for line in [ControlLine::Rts, ControlLine::Dtr] {
            if let Some(state) = payload.overrides.get(line) {
                if let Err(e) = self.transport.set_line(line, state).await {
                    self.status(StatusMessage::error(e.to_string()));
                    return Err(e.into());
                }
                self.session.write().await.config.control_lines.set(line, state);
            }
        }

        if payload.bytes.is_empty() {
            return Ok(0);
        }

        match self.transport.write(&payload.bytes).await {
            Ok(n) => {
                bump(&self.counters.bytes_tx, n as u64);
                bump(&self.counters.payloads_tx, 1);
                if n < payload.bytes.len() {
                    log::warn!("Partial write: {} of {} bytes", n, payload.bytes.len());
                }
                let mirror = self.mirror.lock().ok().and_then(|m| m.clone());
                if let Some(tx) = mirror {
                    let _ = tx.send(payload.bytes[..n].to_vec());
                }
                Ok(n)
            }
            Err(e) => {
                bump(&self.counters.write_errors, 1);
                log::error!("Write failed: {}", e);
                self.status(StatusMessage::error(format!("Write failed: {}", e)));
                Err(e.into())
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Receive loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the receive loop reads.
#[derive(Clone)]
pub struct ReceiveContext {
    pub transport: Arc<dyn SerialTransport>,
    pub settings: Arc<ArcSwap<ReceiveSettings>>,
    pub decoders: Arc<ArcSwap<DecodePipeline>>,
    pub events: mpsc::UnboundedSender<TerminalEvent>,
    pub counters: Arc<Counters>,
}

async fn sleep_or_cancel(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

async fn receive_loop(
    ctx: ReceiveContext,
    mut sent_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    log::debug!("Receive loop started");
    let mut coalescer = Coalescer::new();

    loop {
        // A pending read is only abandoned on cancellation; dropping it for
        // any other branch could lose bytes already taken from the device.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = ctx.transport.read_available(RX_WAIT) => r,
        };
        if cancel.is_cancelled() || !active.load(Ordering::SeqCst) {
            break;
        }

        // Sends that completed during the read come first.
        while let Ok(sent) = sent_rx.try_recv() {
            let settings = ctx.settings.load();
            let update = coalescer.on_sent(&sent, &settings);
            let _ = ctx.events.send(TerminalEvent::Transcript(update));
        }

        match result {
            Ok(chunk) if !chunk.is_empty() => {
                bump(&ctx.counters.bytes_rx, chunk.len() as u64);
                bump(&ctx.counters.chunks_rx, 1);
                let settings = ctx.settings.load();
                let decoders = ctx.decoders.load();
                let received = coalescer.on_received(&chunk, Instant::now(), &settings, &decoders);
                if !received.decode_failures.is_empty() {
                    bump(
                        &ctx.counters.decode_failures,
                        received.decode_failures.len() as u64,
                    );
                }
                let _ = ctx.events.send(TerminalEvent::Transcript(received.update));
                if !sleep_or_cancel(&cancel, RX_POLL_INTERVAL).await {
                    break;
                }
            }
            Ok(_) => {}
            Err(ReadError::NotOpen) => {
                if !sleep_or_cancel(&cancel, RX_IDLE_INTERVAL).await {
                    break;
                }
            }
            Err(e) => {
                bump(&ctx.counters.read_errors, 1);
                log::warn!("Read error (continuing): {}", e);
                if !sleep_or_cancel(&cancel, RX_IDLE_INTERVAL).await {
                    break;
                }
            }
        }
    }
    log::debug!("Receive loop stopped");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Send loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn send_loop(transmitter: Arc<Transmitter>, cycle: SendCycle, cancel: CancellationToken) {
    let period = cycle.effective_interval();
    log::debug!("Send cycle started ({} ms)", period.as_millis());
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = transmitter.send(SendRequest::Cached).await {
                    log::debug!("Cyclic send failed (continuing): {}", e);
                }
            }
        }
    }
    log::debug!("Send cycle stopped");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of the loops belonging to one open device session.
pub struct LoopScheduler {
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    transmitter: Arc<Transmitter>,
    receive: Option<JoinHandle<()>>,
    send: Option<(CancellationToken, JoinHandle<()>)>,
}

impl LoopScheduler {
    /// Start the receive loop. Call after a successful open.
    pub fn start(ctx: ReceiveContext, transmitter: Arc<Transmitter>) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        transmitter.set_mirror(Some(sent_tx));

        let receive = tokio::spawn(receive_loop(ctx, sent_rx, active.clone(), cancel.clone()));
        log::info!("Communication loops started");
        Self {
            active,
            cancel,
            transmitter,
            receive: Some(receive),
            send: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_cycling(&self) -> bool {
        self.send.is_some()
    }

    /// Replace the periodic sender according to `cycle`.
    pub fn set_send_cycle(&mut self, cycle: SendCycle) {
        if let Some((token, _handle)) = self.send.take() {
            token.cancel();
        }
        if cycle.enabled && self.is_active() {
            let token = self.cancel.child_token();
            let handle = tokio::spawn(send_loop(self.transmitter.clone(), cycle, token.clone()));
            self.send = Some((token, handle));
        }
    }

    /// Signal every loop and wait up to `timeout` for each. Loops that do
    /// not finish in time are aborted. Returns `true` on a clean stop.
    pub async fn stop(mut self, timeout: Duration) -> bool {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.transmitter.set_mirror(None);

        let mut clean = true;
        let handles = self
            .receive
            .take()
            .into_iter()
            .chain(self.send.take().map(|(_, h)| h));
        for handle in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("Loop task ended abnormally: {}", e);
                    clean = false;
                }
                Err(_) => {
                    log::warn!("Loop did not stop within {:?}; aborting", timeout);
                    abort.abort();
                    clean = false;
                }
            }
        }
        log::info!("Communication loops stopped");
        clean
    }
}

impl Drop for LoopScheduler {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port scan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enumerate ports until at least one is found, retrying every `retry`
/// with no attempt limit, then publish them as
/// [`TerminalEvent::PortsDiscovered`].
pub fn spawn_port_scan<F>(
    enumerate: F,
    events: mpsc::UnboundedSender<TerminalEvent>,
    retry: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn() -> Vec<SerialPortInfo> + Send + Sync + 'static,
{
    let enumerate = Arc::new(enumerate);
    tokio::spawn(async move {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let scan = enumerate.clone();
            let ports = match tokio::task::spawn_blocking(move || (*scan)()).await {
                Ok(ports) => ports,
                Err(e) => {
                    log::warn!("Port scan task failed: {}", e);
                    Vec::new()
                }
            };
            if !ports.is_empty() {
                log::info!("Found {} serial port(s)", ports.len());
                let _ = events.send(TerminalEvent::PortsDiscovered(ports));
                break;
            }
            log::debug!("No serial ports found (attempt {}), retrying", attempt);
            if !sleep_or_cancel(&cancel, retry).await {
                break;
            }
        }
    })
}
