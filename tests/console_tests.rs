//! End-to-end console tests against the simulated transport.

use scomm_lib::console::Console;
use scomm_lib::{App, Flow};
use scomm_serial::serial::config::{AppConfig, ConfigStore, Preset};
use scomm_serial::serial::service::TerminalOptions;
use scomm_serial::serial::transport::{SerialTransport, SimulatedTransport};
use scomm_serial::serial::{ControlLine, EventReceiver, Terminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    sim: Arc<SimulatedTransport>,
    app: App<Vec<u8>>,
    events: EventReceiver,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.json");
    harness_with(dir, path)
}

fn harness_with(dir: tempfile::TempDir, config_path: PathBuf) -> Harness {
    let mut config = AppConfig::default();
    config.presets.insert(
        "btn-data01".into(),
        Preset {
            title: "ping".into(),
            value: "AA 55".into(),
            hex: true,
        },
    );
    let store = ConfigStore::in_memory(config_path, config);

    let sim = SimulatedTransport::new("SIM0");
    let options = TerminalOptions::from_config(store.config(), "SIM0");
    let (terminal, events) = Terminal::new(sim.clone(), options);
    let app = App::new(
        terminal,
        store,
        Console::new(Vec::new(), 1000),
        dir.path().to_path_buf(),
    );
    Harness {
        sim,
        app,
        events,
        _dir: dir,
    }
}

impl Harness {
    async fn run(&mut self, line: &str) -> Flow {
        self.app.handle_line(line).await.unwrap()
    }

    /// Two drain ticks so the tail entry is printed.
    async fn settle(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.app.drain(&mut self.events).unwrap();
        self.app.drain(&mut self.events).unwrap();
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(self.app.console().out()).to_string()
    }
}

#[tokio::test]
async fn test_send_and_receive_round_trip() {
    let mut h = harness();
    h.sim.set_loopback(true);
    h.run(":open").await;
    h.run(":lf on").await;
    h.run("hello").await;
    h.settle().await;

    assert_eq!(h.sim.drain_tx().await, b"hello\n".to_vec());
    let out = h.output();
    assert!(out.contains("connected to SIM0 @ 115200-8N1"), "{}", out);
    assert!(out.contains("TX: hello\n"), "{}", out);
    assert!(out.contains("RX: hello\n"), "{}", out);

    assert_eq!(h.run(":quit").await, Flow::Quit);
    h.app.shutdown(&mut h.events).await.unwrap();
    assert!(!h.sim.is_open());
}

#[tokio::test]
async fn test_hex_view_and_preset() {
    let mut h = harness();
    h.run(":view hex").await;
    h.run(":open").await;
    h.run(":preset btn-data01").await;
    h.sim.inject_rx(&[0x0D, 0x0A]).await;
    h.settle().await;

    assert_eq!(h.sim.drain_tx().await, vec![0xAA, 0x55]);
    let out = h.output();
    assert!(out.contains("TX: AA 55"), "{}", out);
    assert!(out.contains("RX: 0D 0A"), "{}", out);
}

#[tokio::test]
async fn test_malformed_hex_is_reported_not_sent() {
    let mut h = harness();
    h.run(":open").await;
    h.run(":hex on").await;
    h.run("4").await;
    h.settle().await;

    assert!(h.sim.drain_tx().await.is_empty());
    let out = h.output();
    assert!(out.contains("warn: Send skipped: malformed hex input"), "{}", out);
    assert!(h.app.terminal().is_open().await);
}

#[tokio::test]
async fn test_settings_are_persisted() {
    let mut h = harness();
    h.run(":split 40ms").await;
    h.run(":cycle 250ms").await;
    h.run(":cycle off").await;
    h.run(":baud 9600").await;

    let path = h.app.config().path().to_path_buf();
    let reloaded = ConfigStore::load(&path).unwrap();
    assert_eq!(reloaded.config().split_ms, 40);
    assert_eq!(reloaded.config().cycle_ms, 250);
    assert_eq!(reloaded.baud().value(), 9600);
    assert_eq!(reloaded.preset("btn-data01").unwrap().value, "AA 55");
    assert_eq!(h.app.terminal().receive_settings().gap_window_ms, 40);
    assert!(!h.app.terminal().send_cycle().await.enabled);
}

#[tokio::test]
async fn test_baud_locked_while_open() {
    let mut h = harness();
    h.run(":open").await;
    h.run(":baud 9600").await;
    h.app.drain(&mut h.events).unwrap();
    assert!(h.output().contains("cannot change baud while the device is open"));
    assert_eq!(h.app.config().baud().value(), 115200);
}

#[tokio::test]
async fn test_control_lines_and_stats() {
    let mut h = harness();
    h.run(":open").await;
    h.run(":rts on").await;
    h.run(":dtr off").await;
    assert_eq!(
        h.sim.line_log().await,
        vec![(ControlLine::Rts, true), (ControlLine::Dtr, false)]
    );

    h.run("abc").await;
    h.run(":stats").await;
    h.app.drain(&mut h.events).unwrap();
    assert!(
        h.output().contains("-- rx 0 bytes / 0 chunks, tx 3 bytes / 1 payloads,"),
        "{}",
        h.output()
    );
}

#[tokio::test]
async fn test_failed_settings_save_keeps_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no_such_dir").join("app.json");
    let mut h = harness_with(dir, path);
    h.run(":open").await;

    assert_eq!(h.run(":split 40ms").await, Flow::Continue);
    assert!(h.output().contains("error: settings not saved"), "{}", h.output());
    assert_eq!(h.app.terminal().receive_settings().gap_window_ms, 40);
    assert_eq!(h.app.config().config().split_ms, 40);

    h.run("still here").await;
    assert_eq!(h.sim.drain_tx().await, b"still here".to_vec());
}

#[tokio::test]
async fn test_shutdown_stops_port_scan() {
    let mut h = harness();
    h.app.start_port_scan(Vec::new, Duration::from_secs(60));
    assert!(h.app.is_scanning());

    let started = Instant::now();
    h.app.shutdown(&mut h.events).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.app.is_scanning());
}

#[tokio::test]
async fn test_export_writes_transcript() {
    let mut h = harness();
    h.run(":open").await;
    h.run("AT").await;
    h.settle().await;
    h.run(":export").await;

    let out = h.output();
    let line = out
        .lines()
        .find(|l| l.starts_with("-- exported to "))
        .unwrap();
    let path = line.trim_start_matches("-- exported to ");
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.trim_end().ends_with("TX: AT"), "{}", text);
}

#[tokio::test]
async fn test_send_while_closed_and_unknown_command() {
    let mut h = harness();
    h.run("hi").await;
    h.run(":bogus").await;
    h.app.drain(&mut h.events).unwrap();
    let out = h.output();
    assert!(out.contains("error: device not open"), "{}", out);
    assert!(out.contains("unknown command `:bogus`"), "{}", out);
}
