//! scomm: a console serial debugging assistant built on `scomm-serial`.

pub mod commands;
pub mod console;

use clap::Parser;
use commands::{Command, HELP};
use console::{Console, DRAIN_TICK};
use scomm_serial::serial::config::{AppConfig, ConfigStore};
use scomm_serial::serial::port_scanner;
use scomm_serial::serial::scheduler::PORT_SCAN_RETRY;
use scomm_serial::serial::service::TerminalOptions;
use scomm_serial::serial::system::SystemTransport;
use scomm_serial::serial::transcript::DEFAULT_MAX_LINES;
use scomm_serial::serial::transport::SerialTransport;
use scomm_serial::serial::{
    BaudRate, ConfigError, EventReceiver, RenderMode, SendCycle, SerialPortInfo, Terminal,
    TerminalError,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// scomm: serial debugging assistant
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Serial port to open at startup (scan for ports if omitted)
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Configuration file
    #[arg(short, long, default_value = "app.json")]
    pub config: PathBuf,

    /// Show received data as hex
    #[arg(long)]
    pub hex: bool,

    /// Directory for `:export` without a path
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    pub list: bool,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("console I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Install the `tracing` subscriber. `RUST_LOG` selects the level; the
/// default is `info`. Records from the `log` facade are bridged.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Errors the terminal has already published as status events.
fn already_reported(err: &TerminalError) -> bool {
    matches!(
        err,
        TerminalError::Open(_)
            | TerminalError::Close(_)
            | TerminalError::Write(_)
            | TerminalError::Line(_)
            | TerminalError::Build(_)
    )
}

/// The console front end: terminal, configuration and presentation.
pub struct App<W: Write> {
    terminal: Terminal,
    config: ConfigStore,
    console: Console<W>,
    export_dir: PathBuf,
    /// Background port discovery, cancelled and joined by `shutdown`.
    scan: Option<JoinHandle<()>>,
}

impl<W: Write> App<W> {
    pub fn new(terminal: Terminal, config: ConfigStore, console: Console<W>, export_dir: PathBuf) -> Self {
        Self {
            terminal,
            config,
            console,
            export_dir,
            scan: None,
        }
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn console(&self) -> &Console<W> {
        &self.console
    }

    pub fn drain(&mut self, events: &mut EventReceiver) -> io::Result<usize> {
        self.console.drain(events)
    }

    /// Look for ports every `retry` until one appears.
    pub fn start_port_scan<F>(&mut self, enumerate: F, retry: Duration)
    where
        F: Fn() -> Vec<SerialPortInfo> + Send + Sync + 'static,
    {
        if let Some(old) = self.scan.replace(self.terminal.spawn_port_scan(enumerate, retry)) {
            old.abort();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Save a settings change. A failed save is shown and the session
    /// goes on; the live setting stays applied.
    fn persist(&mut self, f: impl FnOnce(&mut AppConfig)) -> io::Result<()> {
        if let Err(e) = self.config.update(f) {
            log::warn!("Saving settings failed: {}", e);
            self.console
                .notice(&format!("error: settings not saved: {}", e))?;
        }
        Ok(())
    }

    fn report(&mut self, result: Result<(), TerminalError>) -> io::Result<()> {
        match result {
            Err(e) if !already_reported(&e) => self.console.notice(&format!("error: {}", e)),
            _ => Ok(()),
        }
    }

    /// Parse and run one input line.
    pub async fn handle_line(&mut self, line: &str) -> Result<Flow, AppError> {
        match commands::parse(line) {
            Ok(Some(cmd)) => self.execute(cmd).await,
            Ok(None) => Ok(Flow::Continue),
            Err(e) => {
                self.console.notice(&e.to_string())?;
                Ok(Flow::Continue)
            }
        }
    }

    pub async fn execute(&mut self, cmd: Command) -> Result<Flow, AppError> {
        match cmd {
            Command::Send(text) => {
                let r = self.terminal.send_text(&text).await.map(drop);
                self.report(r)?;
            }
            Command::SendCached => {
                let r = self.terminal.send_cached().await.map(drop);
                self.report(r)?;
            }
            Command::Hex(on) => {
                let r = self.terminal.update_payload_source(|s| s.hex = on).map(drop);
                self.report(r)?;
            }
            Command::Cr(on) => {
                let r = self.terminal.update_payload_source(|s| s.append_cr = on).map(drop);
                self.report(r)?;
            }
            Command::Lf(on) => {
                let r = self.terminal.update_payload_source(|s| s.append_lf = on).map(drop);
                self.report(r)?;
            }
            Command::View(mode) => {
                self.terminal.set_render(mode);
                let label = match mode {
                    RenderMode::Hex => "hex",
                    RenderMode::Text => "text",
                };
                self.console.notice(&format!("receive view: {}", label))?;
            }
            Command::Cycle(None) => {
                let mut cycle = self.terminal.send_cycle().await;
                cycle.enabled = false;
                self.terminal.set_send_cycle(cycle).await;
                self.console.notice("send cycle off")?;
            }
            Command::Cycle(Some(ms)) => {
                let cycle = SendCycle::every(ms);
                self.terminal.set_send_cycle(cycle).await;
                self.persist(|c| c.cycle_ms = ms)?;
                self.console.notice(&format!(
                    "send cycle every {} ms",
                    cycle.effective_interval().as_millis()
                ))?;
            }
            Command::Split(ms) => {
                self.terminal.set_gap_window(Duration::from_millis(ms));
                self.persist(|c| c.split_ms = ms)?;
                self.console.notice(&format!("gap window {} ms", ms))?;
            }
            Command::Line(line, state) => {
                let r = self.terminal.set_line(line, state).await;
                self.report(r)?;
            }
            Command::Preset(name) => {
                let r = self.terminal.send_preset(&name).await.map(drop);
                self.report(r)?;
            }
            Command::Export(path) => {
                let written = match path {
                    Some(path) => self.console.sink().export(&path).map(|_| path),
                    None => self.console.sink().export_default(&self.export_dir),
                };
                match written {
                    Ok(path) => self.console.notice(&format!("exported to {}", path.display()))?,
                    Err(e) => self.console.notice(&format!("error: export failed: {}", e))?,
                }
            }
            Command::Port(name) => {
                let r = self.terminal.set_port(name).await;
                self.report(r)?;
            }
            Command::Baud(baud) => {
                let r = self.terminal.set_baud(baud).await;
                if r.is_ok() {
                    self.persist(|c| c.baud = baud)?;
                }
                self.report(r)?;
            }
            Command::Open => {
                let r = self.terminal.open().await;
                self.report(r)?;
            }
            Command::Close => {
                let r = self.terminal.close().await;
                self.report(r)?;
            }
            Command::Ports => {
                let ports = tokio::task::spawn_blocking(port_scanner::list_ports)
                    .await
                    .unwrap_or_default();
                self.console.print_ports(&ports)?;
            }
            Command::Stats => {
                let stats = self.terminal.stats();
                self.console.print_stats(&stats)?;
            }
            Command::Clear => self.console.clear(),
            Command::Help => {
                for line in HELP.lines() {
                    self.console.notice(line)?;
                }
            }
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    pub async fn shutdown(&mut self, events: &mut EventReceiver) -> io::Result<()> {
        self.terminal.shutdown().await;
        if let Some(scan) = self.scan.take() {
            if tokio::time::timeout(Duration::from_secs(1), scan).await.is_err() {
                log::warn!("Port scan did not stop");
            }
        }
        self.console.drain(events)?;
        self.console.flush_tail()
    }
}

/// Run the console until `:quit`, end of input or Ctrl-C.
pub async fn run(cli: Cli) -> Result<(), AppError> {
    if cli.list {
        let ports = tokio::task::spawn_blocking(port_scanner::list_ports)
            .await
            .unwrap_or_default();
        let mut console = Console::new(io::stdout(), 1);
        console.print_ports(&ports)?;
        return Ok(());
    }

    let config = ConfigStore::load(&cli.config)?;
    let port = cli.port.clone().unwrap_or_default();
    let mut options = TerminalOptions::from_config(config.config(), port.clone());
    if let Some(baud) = cli.baud {
        options.device.baud_rate = BaudRate(baud);
    }
    if cli.hex {
        options.receive.render = RenderMode::Hex;
    }

    let transport: Arc<dyn SerialTransport> = Arc::new(SystemTransport::new());
    let (terminal, mut events) = Terminal::new(transport, options);
    let export_dir = cli.export_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let mut app = App::new(
        terminal,
        config,
        Console::new(io::stdout(), DEFAULT_MAX_LINES),
        export_dir,
    );

    if port.is_empty() {
        app.start_port_scan(port_scanner::list_ports, PORT_SCAN_RETRY);
        app.console
            .notice("no port given; scanning (use :port <name> then :open)")?;
    } else if let Err(e) = app.terminal.open().await {
        log::debug!("Startup open failed: {}", e);
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(DRAIN_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            _ = tick.tick() => {
                app.drain(&mut events)?;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if app.handle_line(&line).await? == Flow::Quit {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    app.shutdown(&mut events).await?;
    Ok(())
}

/// Parse arguments, install logging and run.
pub async fn main_entry() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_logging();
    run(cli).await
}
