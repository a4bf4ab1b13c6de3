//! Console presentation: drains the terminal's event queue into a
//! transcript sink and prints finished lines.
//!
//! The receive tail may still be replaced by later chunks, so it is only
//! printed once a newer entry arrives or a whole drain tick passes without
//! touching it. A line is printed at most once: later replacements of an
//! entry already on screen only update the sink, which `:export` writes.

use scomm_serial::serial::transcript::TranscriptSink;
use scomm_serial::serial::{
    EventReceiver, SerialPortInfo, SessionStats, StatusLevel, TerminalEvent, TranscriptEntry,
    TranscriptUpdate,
};
use std::io::{self, Write};
use std::time::Duration;

/// Queue drain interval.
pub const DRAIN_TICK: Duration = Duration::from_millis(50);

pub struct Console<W: Write> {
    sink: TranscriptSink,
    out: W,
    /// Id of the last entry, if it has not been printed yet.
    pending_tail: Option<u64>,
    /// Id of the last entry written to `out`.
    printed_tail: Option<u64>,
}

impl<W: Write> Console<W> {
    pub fn new(out: W, max_lines: usize) -> Self {
        Self {
            sink: TranscriptSink::new(max_lines),
            out,
            pending_tail: None,
            printed_tail: None,
        }
    }

    pub fn sink(&self) -> &TranscriptSink {
        &self.sink
    }

    pub fn out(&self) -> &W {
        &self.out
    }

    /// Apply everything queued so far. Returns the number of events.
    pub fn drain(&mut self, rx: &mut EventReceiver) -> io::Result<usize> {
        let mut applied = 0;
        let mut tail_touched = false;
        while let Ok(event) = rx.try_recv() {
            tail_touched |= matches!(event, TerminalEvent::Transcript(_));
            self.handle(event)?;
            applied += 1;
        }
        if !tail_touched {
            self.flush_tail()?;
        }
        self.out.flush()?;
        Ok(applied)
    }

    pub fn handle(&mut self, event: TerminalEvent) -> io::Result<()> {
        match event {
            TerminalEvent::Transcript(update) => self.apply(update),
            TerminalEvent::Status(msg) => {
                let tag = match msg.level {
                    StatusLevel::Info => "info",
                    StatusLevel::Warn => "warn",
                    StatusLevel::Error => "error",
                };
                self.notice(&format!("{}: {}", tag, msg.text))
            }
            TerminalEvent::Opened {
                port_name,
                shorthand,
            } => self.notice(&format!("connected to {} @ {}", port_name, shorthand)),
            TerminalEvent::Closed { reason } => {
                self.flush_tail()?;
                self.notice(&format!("disconnected ({})", reason))
            }
            TerminalEvent::PortsDiscovered(ports) => self.print_ports(&ports),
        }
    }

    fn apply(&mut self, update: TranscriptUpdate) -> io::Result<()> {
        let id = update.entry().id;
        if self.pending_tail.is_some_and(|tail| tail != id) {
            self.flush_tail()?;
        }
        self.sink.apply(update);
        if self.printed_tail != Some(id) {
            self.pending_tail = Some(id);
        }
        Ok(())
    }

    /// Print the tail if it has not been printed yet.
    pub fn flush_tail(&mut self) -> io::Result<()> {
        let Some(id) = self.pending_tail.take() else {
            return Ok(());
        };
        let line = self
            .sink
            .entries()
            .rev()
            .find(|e| e.id == id)
            .map(TranscriptEntry::format_line);
        if let Some(line) = line {
            writeln!(self.out, "{}", line)?;
            self.printed_tail = Some(id);
        }
        Ok(())
    }

    /// A line outside the transcript.
    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        self.flush_tail()?;
        writeln!(self.out, "-- {}", text)
    }

    pub fn print_ports(&mut self, ports: &[SerialPortInfo]) -> io::Result<()> {
        self.flush_tail()?;
        if ports.is_empty() {
            return writeln!(self.out, "-- no serial ports found");
        }
        writeln!(self.out, "-- {} serial port(s):", ports.len())?;
        for port in ports {
            writeln!(self.out, "   {} [{}]", port.display_name, port.port_type.label())?;
        }
        Ok(())
    }

    pub fn print_stats(&mut self, stats: &SessionStats) -> io::Result<()> {
        self.notice(&format!(
            "rx {} bytes / {} chunks, tx {} bytes / {} payloads, errors: read {} write {} build {} decode {}",
            stats.bytes_rx,
            stats.chunks_rx,
            stats.bytes_tx,
            stats.payloads_tx,
            stats.read_errors,
            stats.write_errors,
            stats.build_errors,
            stats.decode_failures
        ))
    }

    pub fn clear(&mut self) {
        self.sink.clear();
        self.pending_tail = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use scomm_serial::serial::{Category, StatusMessage};
    use tokio::sync::mpsc;

    fn entry(id: u64, category: Category, text: &str) -> TranscriptEntry {
        TranscriptEntry {
            id,
            timestamp: Local::now(),
            category,
            text: text.into(),
            annotation: String::new(),
        }
    }

    fn printed(console: &Console<Vec<u8>>) -> String {
        String::from_utf8_lossy(console.out()).to_string()
    }

    #[test]
    fn test_tail_printed_once_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut console = Console::new(Vec::new(), 100);

        tx.send(TerminalEvent::Transcript(TranscriptUpdate::Append(entry(
            1,
            Category::Received,
            "par",
        ))))
        .unwrap();
        console.drain(&mut rx).unwrap();
        assert_eq!(printed(&console), "");

        tx.send(TerminalEvent::Transcript(TranscriptUpdate::ReplaceTail(entry(
            1,
            Category::Received,
            "partial",
        ))))
        .unwrap();
        console.drain(&mut rx).unwrap();
        assert_eq!(printed(&console), "");

        // An idle tick finishes the line.
        console.drain(&mut rx).unwrap();
        let out = printed(&console);
        assert!(out.trim_end().ends_with("RX: partial"), "{}", out);
        assert_eq!(out.lines().count(), 1);
        assert_eq!(console.sink().len(), 1);
    }

    #[test]
    fn test_tail_replaced_after_printing_is_not_reprinted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut console = Console::new(Vec::new(), 100);

        tx.send(TerminalEvent::Transcript(TranscriptUpdate::Append(entry(
            42,
            Category::Received,
            "AB",
        ))))
        .unwrap();
        console.drain(&mut rx).unwrap();
        // Idle tick prints the tail.
        console.drain(&mut rx).unwrap();
        assert_eq!(printed(&console).lines().count(), 1);

        // The run continues after the line went out.
        tx.send(TerminalEvent::Transcript(TranscriptUpdate::ReplaceTail(entry(
            42,
            Category::Received,
            "ABCD",
        ))))
        .unwrap();
        console.drain(&mut rx).unwrap();
        console.drain(&mut rx).unwrap();

        let out = printed(&console);
        assert_eq!(out.lines().count(), 1, "{}", out);
        assert!(out.trim_end().ends_with("RX: AB"), "{}", out);
        assert_eq!(console.sink().len(), 1);
        assert_eq!(console.sink().entries().next().unwrap().text, "ABCD");

        // The next entry still prints.
        tx.send(TerminalEvent::Transcript(TranscriptUpdate::Append(entry(
            43,
            Category::Sent,
            "AT",
        ))))
        .unwrap();
        console.drain(&mut rx).unwrap();
        console.drain(&mut rx).unwrap();
        assert_eq!(printed(&console).lines().count(), 2);
    }

    #[test]
    fn test_stats_line() {
        let mut console = Console::new(Vec::new(), 100);
        let stats = SessionStats {
            bytes_rx: 100,
            chunks_rx: 7,
            bytes_tx: 12,
            payloads_tx: 3,
            read_errors: 1,
            write_errors: 2,
            build_errors: 4,
            decode_failures: 5,
        };
        console.print_stats(&stats).unwrap();
        assert_eq!(
            printed(&console),
            "-- rx 100 bytes / 7 chunks, tx 12 bytes / 3 payloads, \
             errors: read 1 write 2 build 4 decode 5\n"
        );
    }

    #[test]
    fn test_new_entry_flushes_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut console = Console::new(Vec::new(), 100);
        tx.send(TerminalEvent::Transcript(TranscriptUpdate::Append(entry(
            1,
            Category::Sent,
            "AT",
        ))))
        .unwrap();
        tx.send(TerminalEvent::Transcript(TranscriptUpdate::Append(entry(
            2,
            Category::Received,
            "OK",
        ))))
        .unwrap();
        console.drain(&mut rx).unwrap();
        let out = printed(&console);
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("TX: AT"));
    }

    #[test]
    fn test_status_and_lifecycle_notices() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut console = Console::new(Vec::new(), 100);
        tx.send(TerminalEvent::Status(StatusMessage::warn("Send skipped"))).unwrap();
        tx.send(TerminalEvent::Closed {
            reason: "closed by user".into(),
        })
        .unwrap();
        assert_eq!(console.drain(&mut rx).unwrap(), 2);
        assert_eq!(
            printed(&console),
            "-- warn: Send skipped\n-- disconnected (closed by user)\n"
        );
    }

    #[test]
    fn test_clear_drops_pending_tail() {
        let mut console = Console::new(Vec::new(), 100);
        console
            .handle(TerminalEvent::Transcript(TranscriptUpdate::Append(entry(
                1,
                Category::Received,
                "x",
            ))))
            .unwrap();
        console.clear();
        console.flush_tail().unwrap();
        assert!(console.sink().is_empty());
        assert_eq!(printed(&console), "");
    }
}
