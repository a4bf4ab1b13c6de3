//! Serial terminal façade.
//!
//! Owns the device session, the outbound queue, the live receive settings
//! and the loop scheduler, and publishes everything the presentation layer
//! needs through a single event queue.

use crate::serial::coalescer::ReceiveSettings;
use crate::serial::config::{AppConfig, Preset};
use crate::serial::decode::{DecodePipeline, DecodeRule};
use crate::serial::error::*;
use crate::serial::outbound::{OutboundQueue, PayloadSource};
use crate::serial::scheduler::{
    self, Counters, LoopScheduler, ReceiveContext, SendRequest, Transmitter,
};
use crate::serial::transport::SerialTransport;
use crate::serial::types::*;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The presentation side of the event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<TerminalEvent>;

/// How long [`Terminal::close`] waits for each loop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Initial terminal state.
#[derive(Debug, Clone, Default)]
pub struct TerminalOptions {
    pub device: DeviceConfig,
    pub receive: ReceiveSettings,
    pub send_cycle: SendCycle,
    pub payload: PayloadSource,
    pub decode_rules: BTreeMap<String, DecodeRule>,
    pub presets: BTreeMap<String, Preset>,
}

impl TerminalOptions {
    pub fn from_config(config: &AppConfig, port_name: impl Into<String>) -> Self {
        Self {
            device: DeviceConfig {
                port_name: port_name.into(),
                baud_rate: config.baud,
                ..Default::default()
            },
            receive: ReceiveSettings {
                encoding: config.encoding,
                gap_window_ms: config.split_ms,
                ..Default::default()
            },
            send_cycle: config.send_cycle(),
            payload: PayloadSource {
                encoding: config.encoding,
                ..Default::default()
            },
            decode_rules: config.decode_rules(),
            presets: config.presets.clone(),
        }
    }
}

struct Lifecycle {
    scheduler: Option<LoopScheduler>,
    cycle: SendCycle,
}

/// One serial terminal bound to one transport.
pub struct Terminal {
    transport: Arc<dyn SerialTransport>,
    session: Arc<RwLock<DeviceSession>>,
    settings: Arc<ArcSwap<ReceiveSettings>>,
    decoders: Arc<ArcSwap<DecodePipeline>>,
    outbound: Arc<OutboundQueue>,
    transmitter: Arc<Transmitter>,
    counters: Arc<Counters>,
    events: mpsc::UnboundedSender<TerminalEvent>,
    /// Serialises open, close and send-cycle changes.
    lifecycle: Mutex<Lifecycle>,
    presets: std::sync::RwLock<BTreeMap<String, Preset>>,
    background: CancellationToken,
    stop_timeout: Duration,
}

impl Terminal {
    pub fn new(transport: Arc<dyn SerialTransport>, options: TerminalOptions) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new(RwLock::new(DeviceSession {
            config: options.device,
            ..Default::default()
        }));
        let outbound = Arc::new(OutboundQueue::new());
        outbound.set_source(options.payload);
        let counters = Arc::new(Counters::default());
        let transmitter = Arc::new(Transmitter::new(
            transport.clone(),
            outbound.clone(),
            session.clone(),
            events.clone(),
            counters.clone(),
        ));
        let decoders = DecodePipeline::compile(&options.decode_rules);

        let terminal = Self {
            transport,
            session,
            settings: Arc::new(ArcSwap::from_pointee(options.receive)),
            decoders: Arc::new(ArcSwap::from_pointee(decoders)),
            outbound,
            transmitter,
            counters,
            events,
            lifecycle: Mutex::new(Lifecycle {
                scheduler: None,
                cycle: options.send_cycle,
            }),
            presets: std::sync::RwLock::new(options.presets),
            background: CancellationToken::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        };
        (terminal, rx)
    }

    /// Override the per-loop stop wait.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn emit(&self, event: TerminalEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, msg: StatusMessage) {
        self.emit(TerminalEvent::Status(msg));
    }

    // ── Device session ────────────────────────────────────────────

    pub async fn session(&self) -> DeviceSession {
        self.session.read().await.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.session.read().await.is_open
    }

    pub async fn set_port(&self, name: impl Into<String>) -> Result<(), TerminalError> {
        self.session.write().await.set_port_name(name)
    }

    pub async fn set_baud(&self, baud: BaudRate) -> Result<(), TerminalError> {
        self.session.write().await.set_baud_rate(baud)
    }

    /// Open the device and start the loops. Failure is reported once and
    /// leaves the terminal closed; there is no retry.
    pub async fn open(&self) -> Result<(), TerminalError> {
        let mut life = self.lifecycle.lock().await;
        let config = {
            let session = self.session.read().await;
            if session.is_open {
                return Err(OpenError::AlreadyOpen(session.config.port_name.clone()).into());
            }
            session.config.clone()
        };

        let hold = self.transmitter.hold_sends().await;
        if let Err(e) = self.transport.open(&config).await {
            log::error!("Failed to open {}: {}", config.port_name, e);
            self.status(StatusMessage::error(format!(
                "Failed to open {}: {}",
                config.port_name, e
            )));
            return Err(e.into());
        }
        let ctx = ReceiveContext {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            decoders: self.decoders.clone(),
            events: self.events.clone(),
            counters: self.counters.clone(),
        };
        let mut sched = LoopScheduler::start(ctx, self.transmitter.clone());
        sched.set_send_cycle(life.cycle);
        life.scheduler = Some(sched);
        self.session.write().await.mark_open();
        drop(hold);

        let shorthand = config.shorthand();
        log::info!("Opened {} ({})", config.port_name, shorthand);
        self.status(StatusMessage::info(format!(
            "Opened {} ({})",
            config.port_name, shorthand
        )));
        self.emit(TerminalEvent::Opened {
            port_name: config.port_name,
            shorthand,
        });
        Ok(())
    }

    /// Stop the loops, then close the device. Closing a closed terminal
    /// is a no-op.
    pub async fn close(&self) -> Result<(), TerminalError> {
        self.close_with_reason("closed by user").await
    }

    async fn close_with_reason(&self, reason: &str) -> Result<(), TerminalError> {
        let mut life = self.lifecycle.lock().await;
        if let Some(sched) = life.scheduler.take() {
            if !sched.stop(self.stop_timeout).await {
                log::warn!("Loops did not stop cleanly");
            }
        }
        if !self.session.read().await.is_open && !self.transport.is_open() {
            return Ok(());
        }

        let result = self.transport.close().await;
        let port_name = {
            let mut session = self.session.write().await;
            session.mark_closed();
            session.config.port_name.clone()
        };
        match &result {
            Ok(()) => {
                log::info!("Closed {}", port_name);
                self.status(StatusMessage::info(format!("Closed {}", port_name)));
            }
            Err(e) => {
                log::error!("Error closing {}: {}", port_name, e);
                self.status(StatusMessage::error(format!(
                    "Error closing {}: {}",
                    port_name, e
                )));
            }
        }
        self.emit(TerminalEvent::Closed {
            reason: reason.to_string(),
        });
        result.map_err(Into::into)
    }

    /// Close the device and cancel every background task.
    pub async fn shutdown(&self) {
        self.background.cancel();
        if let Err(e) = self.close_with_reason("shutdown").await {
            log::warn!("Shutdown close failed: {}", e);
        }
        log::info!("Terminal shut down");
    }

    /// Scan for ports in the background until at least one is found.
    pub fn spawn_port_scan<F>(&self, enumerate: F, retry: Duration) -> JoinHandle<()>
    where
        F: Fn() -> Vec<SerialPortInfo> + Send + Sync + 'static,
    {
        scheduler::spawn_port_scan(
            enumerate,
            self.events.clone(),
            retry,
            self.background.child_token(),
        )
    }

    // ── Sending ───────────────────────────────────────────────────

    pub fn payload_source(&self) -> PayloadSource {
        self.outbound.source()
    }

    /// Replace the outbound input and rebuild the cached payload.
    pub fn set_payload_source(&self, source: PayloadSource) -> Result<usize, TerminalError> {
        self.outbound.set_source(source);
        self.rebuild()
    }

    /// Edit the outbound input and rebuild the cached payload.
    pub fn update_payload_source(
        &self,
        f: impl FnOnce(&mut PayloadSource),
    ) -> Result<usize, TerminalError> {
        self.outbound.update_source(f);
        self.rebuild()
    }

    fn rebuild(&self) -> Result<usize, TerminalError> {
        self.outbound.rebuild().map_err(|e| {
            self.status(StatusMessage::warn(e.to_string()));
            e.into()
        })
    }

    /// Send the last built payload.
    pub async fn send_cached(&self) -> Result<usize, TerminalError> {
        self.transmitter.send(SendRequest::Cached).await
    }

    /// Rebuild from `source`, apply `overrides` once, then send.
    pub async fn send_fresh(
        &self,
        source: PayloadSource,
        overrides: ControlLines,
    ) -> Result<usize, TerminalError> {
        self.transmitter
            .send(SendRequest::Fresh { source, overrides })
            .await
    }

    /// Fresh send of `text` using the current hex/encoding/CR/LF flags.
    pub async fn send_text(&self, text: &str) -> Result<usize, TerminalError> {
        let mut source = self.outbound.source();
        source.text = text.to_string();
        self.send_fresh(source, ControlLines::default()).await
    }

    pub fn set_presets(&self, presets: BTreeMap<String, Preset>) {
        if let Ok(mut slot) = self.presets.write() {
            *slot = presets;
        }
    }

    pub fn preset_names(&self) -> Vec<String> {
        self.presets
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Fresh send of a stored preset with its own hex flag.
    pub async fn send_preset(&self, name: &str) -> Result<usize, TerminalError> {
        let preset = self
            .presets
            .read()
            .ok()
            .and_then(|p| p.get(name).cloned())
            .ok_or_else(|| TerminalError::UnknownPreset(name.to_string()))?;
        let mut source = self.outbound.source();
        source.text = preset.value;
        source.hex = preset.hex;
        self.send_fresh(source, ControlLines::default()).await
    }

    /// Set RTS or DTR. While closed the state is only recorded and is
    /// applied on the next open.
    pub async fn set_line(&self, line: ControlLine, state: bool) -> Result<(), TerminalError> {
        let mut session = self.session.write().await;
        if session.is_open {
            if let Err(e) = self.transport.set_line(line, state).await {
                self.status(StatusMessage::error(e.to_string()));
                return Err(e.into());
            }
        }
        session.config.control_lines.set(line, state);
        log::debug!("{} set to {}", line.label(), state);
        Ok(())
    }

    pub async fn send_cycle(&self) -> SendCycle {
        self.lifecycle.lock().await.cycle
    }

    /// Enable, disable or retime the periodic sender.
    pub async fn set_send_cycle(&self, cycle: SendCycle) {
        let mut life = self.lifecycle.lock().await;
        life.cycle = cycle;
        if let Some(sched) = life.scheduler.as_mut() {
            sched.set_send_cycle(cycle);
        }
        if cycle.enabled {
            log::info!("Send cycle every {} ms", cycle.effective_interval().as_millis());
        } else {
            log::info!("Send cycle off");
        }
    }

    // ── Receive settings ──────────────────────────────────────────

    pub fn receive_settings(&self) -> ReceiveSettings {
        **self.settings.load()
    }

    fn update_settings(&self, f: impl Fn(&mut ReceiveSettings)) {
        self.settings.rcu(|current| {
            let mut next = **current;
            f(&mut next);
            next
        });
    }

    pub fn set_gap_window(&self, window: Duration) {
        let ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.update_settings(|s| s.gap_window_ms = ms);
    }

    pub fn set_render(&self, render: RenderMode) {
        self.update_settings(|s| s.render = render);
    }

    /// Switch the encoding for both received text and outbound text.
    pub fn set_encoding(&self, encoding: TextEncoding) -> Result<usize, TerminalError> {
        self.update_settings(|s| s.encoding = encoding);
        self.update_payload_source(|s| s.encoding = encoding)
    }

    /// Replace the decode rules. Returns the names of rules that do not
    /// compile; they are skipped at decode time.
    pub fn set_decode_rules(&self, rules: &BTreeMap<String, DecodeRule>) -> Vec<String> {
        let pipeline = DecodePipeline::compile(rules);
        let broken: Vec<String> = pipeline.broken_rules().into_iter().map(String::from).collect();
        for name in &broken {
            self.status(StatusMessage::warn(format!("Decode rule {} does not compile", name)));
        }
        log::info!("{} decode rule(s) active", pipeline.len());
        self.decoders.store(Arc::new(pipeline));
        broken
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::transport::SimulatedTransport;

    fn terminal_with(options: TerminalOptions) -> (Arc<SimulatedTransport>, Terminal, EventReceiver) {
        let sim = SimulatedTransport::new("SIM0");
        let (terminal, rx) = Terminal::new(sim.clone(), options);
        (sim, terminal, rx)
    }

    fn terminal() -> (Arc<SimulatedTransport>, Terminal, EventReceiver) {
        let mut options = TerminalOptions::default();
        options.device.port_name = "SIM0".into();
        terminal_with(options)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<TerminalEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn texts(events: &[TerminalEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                TerminalEvent::Transcript(u) => Some(u.entry().display_text()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_open_close_lifecycle() {
        let (sim, term, mut rx) = terminal();
        term.open().await.unwrap();
        assert!(term.is_open().await);
        assert!(sim.is_open());
        assert!(term.session().await.opened_at.is_some());

        term.close().await.unwrap();
        assert!(!term.is_open().await);
        assert!(!sim.is_open());

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, TerminalEvent::Opened { shorthand, .. } if shorthand == "115200-8N1")));
        assert!(matches!(events.last(), Some(TerminalEvent::Closed { .. })));

        // Closing again is a no-op.
        term.close().await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_port_and_baud_locked_while_open() {
        let (_sim, term, _rx) = terminal();
        term.set_baud(BaudRate(9600)).await.unwrap();
        term.open().await.unwrap();
        assert!(matches!(
            term.set_baud(BaudRate(57600)).await,
            Err(TerminalError::SessionLocked("baud"))
        ));
        assert!(matches!(
            term.set_port("COM9").await,
            Err(TerminalError::SessionLocked("port"))
        ));
        assert_eq!(term.session().await.config.baud_rate, BaudRate(9600));
        term.close().await.unwrap();
        term.set_port("COM9").await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_is_reported_once_and_leaves_closed() {
        let (sim, term, mut rx) = terminal();
        sim.fail_next_open(OpenError::DeviceBusy("SIM0".into())).await;
        let err = term.open().await.unwrap_err();
        assert!(matches!(err, TerminalError::Open(OpenError::DeviceBusy(_))));
        assert!(!term.is_open().await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TerminalEvent::Status(s) if s.level == StatusLevel::Error));

        // No retry happened; a second explicit open succeeds.
        term.open().await.unwrap();
        term.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_open_rejected() {
        let (_sim, term, _rx) = terminal();
        term.open().await.unwrap();
        assert!(matches!(
            term.open().await,
            Err(TerminalError::Open(OpenError::AlreadyOpen(_)))
        ));
        term.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_mid_receive() {
        let (sim, term, mut rx) = terminal();
        term.open().await.unwrap();

        let feeder = {
            let sim = sim.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    sim.inject_rx(b"x").await;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = std::time::Instant::now();
        term.close().await.unwrap();
        assert!(started.elapsed() < DEFAULT_STOP_TIMEOUT * 2);
        assert!(!term.is_open().await);
        let _ = feeder.await;

        let events = drain(&mut rx);
        let closed_at = events
            .iter()
            .position(|e| matches!(e, TerminalEvent::Closed { .. }))
            .unwrap();
        assert!(events[closed_at..]
            .iter()
            .all(|e| !matches!(e, TerminalEvent::Transcript(_))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(texts(&drain(&mut rx)).is_empty());
    }

    /// Opens the inner transport, then waits for `release` before returning.
    struct SlowOpen {
        inner: Arc<SimulatedTransport>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl SerialTransport for SlowOpen {
        async fn open(&self, config: &DeviceConfig) -> Result<(), OpenError> {
            self.inner.open(config).await?;
            self.release.notified().await;
            Ok(())
        }
        async fn close(&self) -> Result<(), CloseError> {
            self.inner.close().await
        }
        async fn read_available(&self, max_wait: Duration) -> Result<Vec<u8>, ReadError> {
            self.inner.read_available(max_wait).await
        }
        async fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
            self.inner.write(data).await
        }
        async fn set_line(&self, line: ControlLine, state: bool) -> Result<(), LineError> {
            self.inner.set_line(line, state).await
        }
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    #[tokio::test]
    async fn test_send_during_open_is_mirrored() {
        let sim = SimulatedTransport::new("SIM0");
        let release = Arc::new(tokio::sync::Notify::new());
        let transport = Arc::new(SlowOpen {
            inner: sim.clone(),
            release: release.clone(),
        });
        let mut options = TerminalOptions::default();
        options.device.port_name = "SIM0".into();
        let (term, mut rx) = Terminal::new(transport, options);
        let term = Arc::new(term);

        let opening = {
            let term = term.clone();
            tokio::spawn(async move { term.open().await })
        };
        while !sim.is_open() {
            tokio::task::yield_now().await;
        }

        // The device is open but the loops are not wired yet.
        let sending = {
            let term = term.clone();
            tokio::spawn(async move { term.send_text("AT").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sim.drain_tx().await.is_empty());

        release.notify_one();
        opening.await.unwrap().unwrap();
        assert_eq!(sending.await.unwrap().unwrap(), 2);
        assert_eq!(sim.drain_tx().await, b"AT".to_vec());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            TerminalEvent::Transcript(u)
                if u.entry().category == Category::Sent && u.entry().text == "AT"
        )));
        term.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_when_closed() {
        let (_sim, term, _rx) = terminal();
        assert!(matches!(term.send_text("hi").await, Err(TerminalError::NotOpen)));
    }

    #[tokio::test]
    async fn test_send_text_uses_current_flags() {
        let (sim, term, _rx) = terminal();
        term.update_payload_source(|s| {
            s.append_cr = true;
            s.append_lf = true;
        })
        .unwrap();
        term.open().await.unwrap();
        assert_eq!(term.send_text("AT").await.unwrap(), 4);
        assert_eq!(sim.drain_tx().await, b"AT\r\n".to_vec());

        // A cached send repeats the last build.
        term.send_cached().await.unwrap();
        assert_eq!(sim.drain_tx().await, b"AT\r\n".to_vec());
        assert_eq!(term.stats().payloads_tx, 2);
        term.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_preset() {
        let mut options = TerminalOptions::default();
        options.presets.insert(
            "btn-data01".into(),
            Preset {
                title: "ping".into(),
                value: "AA 55".into(),
                hex: true,
            },
        );
        let (sim, term, _rx) = terminal_with(options);
        term.open().await.unwrap();
        assert_eq!(term.send_preset("btn-data01").await.unwrap(), 2);
        assert_eq!(sim.drain_tx().await, vec![0xAA, 0x55]);
        assert!(matches!(
            term.send_preset("btn-data99").await,
            Err(TerminalError::UnknownPreset(_))
        ));
        assert_eq!(term.preset_names(), vec!["btn-data01".to_string()]);
        term.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_hex_input_reports_warning() {
        let (_sim, term, mut rx) = terminal();
        let err = term.set_payload_source(PayloadSource::hex("ABC")).unwrap_err();
        assert!(matches!(err, TerminalError::Build(BuildError::MalformedHex(_))));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], TerminalEvent::Status(s) if s.level == StatusLevel::Warn));
    }

    #[tokio::test]
    async fn test_control_lines_recorded_while_closed_applied_on_open() {
        let (sim, term, _rx) = terminal();
        term.set_line(ControlLine::Dtr, true).await.unwrap();
        assert!(sim.line_log().await.is_empty());

        term.open().await.unwrap();
        assert_eq!(sim.lines().await.dtr, Some(true));

        term.set_line(ControlLine::Rts, false).await.unwrap();
        assert_eq!(sim.lines().await.rts, Some(false));
        assert_eq!(
            term.session().await.config.control_lines,
            ControlLines {
                rts: Some(false),
                dtr: Some(true)
            }
        );
        term.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_rules_annotate_received_entries() {
        let (sim, term, mut rx) = terminal();
        let mut rules = BTreeMap::new();
        rules.insert(
            "btn-unpack01".to_string(),
            DecodeRule {
                name: "btn-unpack01".into(),
                title: "temp".into(),
                expression: "s16(0) / 10".into(),
                enabled: true,
            },
        );
        rules.insert(
            "btn-unpack02".to_string(),
            DecodeRule {
                name: "btn-unpack02".into(),
                title: "oops".into(),
                expression: "u16(".into(),
                enabled: true,
            },
        );
        assert_eq!(term.set_decode_rules(&rules), vec!["btn-unpack02".to_string()]);
        term.set_render(RenderMode::Hex);

        term.open().await.unwrap();
        sim.inject_rx(&[0x00, 0xFA]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        term.close().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(texts(&events), vec!["00 FA [temp: 25]".to_string()]);
        assert!(term.stats().decode_failures >= 1);
    }

    #[tokio::test]
    async fn test_live_settings_changes() {
        let (_sim, term, _rx) = terminal();
        term.set_gap_window(Duration::from_millis(75));
        term.set_render(RenderMode::Hex);
        term.set_encoding(TextEncoding::Latin1).unwrap();
        let settings = term.receive_settings();
        assert_eq!(settings.gap_window_ms, 75);
        assert_eq!(settings.render, RenderMode::Hex);
        assert_eq!(settings.encoding, TextEncoding::Latin1);
        assert_eq!(term.payload_source().encoding, TextEncoding::Latin1);
    }

    #[tokio::test]
    async fn test_send_cycle_survives_reopen() {
        let (sim, term, _rx) = terminal();
        term.set_payload_source(PayloadSource::hex("01")).unwrap();
        term.set_send_cycle(SendCycle::every(10)).await;
        term.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        term.close().await.unwrap();
        assert!(!sim.drain_tx().await.is_empty());

        term.open().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        term.set_send_cycle(SendCycle::default()).await;
        term.close().await.unwrap();
        assert!(!sim.drain_tx().await.is_empty());
        assert!(!term.send_cycle().await.enabled);
    }

    #[tokio::test]
    async fn test_port_scan_via_terminal_cancelled_by_shutdown() {
        let (_sim, term, _rx) = terminal();
        let handle = term.spawn_port_scan(Vec::new, Duration::from_secs(60));
        term.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_options_from_config() {
        let mut config = AppConfig::default();
        config.baud = BaudRate(9600);
        config.split_ms = 40;
        config.encoding = TextEncoding::Ascii;
        let options = TerminalOptions::from_config(&config, "COM3");
        assert_eq!(options.device.port_name, "COM3");
        assert_eq!(options.device.baud_rate, BaudRate(9600));
        assert_eq!(options.receive.gap_window_ms, 40);
        assert_eq!(options.payload.encoding, TextEncoding::Ascii);
        assert!(!options.send_cycle.enabled);
    }
}
