//! Inbound coalescing.
//!
//! Receive chunks that arrive within the gap window of each other form one
//! transcript entry. A continuation re-renders the whole accumulated run
//! and replaces the tail entry instead of appending to it. Sending always
//! ends the current run, and so does a run reaching `max_run_bytes`.

use crate::serial::decode::DecodePipeline;
use crate::serial::error::DecodeRuleError;
use crate::serial::transport::bytes_to_hex;
use crate::serial::types::*;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Entry ids are unique for the life of the process, so a reopened device
/// never reuses an id still present in the transcript.
static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Default cap on the bytes one received entry may hold.
pub const DEFAULT_MAX_RUN_BYTES: usize = 4096;

fn default_max_run_bytes() -> usize {
    DEFAULT_MAX_RUN_BYTES
}

/// Settings read by the receive path on every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveSettings {
    pub render: RenderMode,
    pub encoding: TextEncoding,
    /// Maximum inter-arrival delay, in milliseconds, for two chunks to
    /// belong to the same entry.
    pub gap_window_ms: u64,
    /// A chunk that would take the run past this size starts a new entry.
    #[serde(default = "default_max_run_bytes")]
    pub max_run_bytes: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            render: RenderMode::Text,
            encoding: TextEncoding::Utf8,
            gap_window_ms: 20,
            max_run_bytes: DEFAULT_MAX_RUN_BYTES,
        }
    }
}

impl ReceiveSettings {
    pub fn gap_window(&self) -> Duration {
        Duration::from_millis(self.gap_window_ms)
    }

    pub fn render(&self, data: &[u8]) -> String {
        match self.render {
            RenderMode::Hex => bytes_to_hex(data),
            RenderMode::Text => self.encoding.decode_lossy(data),
        }
    }
}

/// Result of feeding one received chunk.
#[derive(Debug)]
pub struct Received {
    pub update: TranscriptUpdate,
    /// Rules that failed on this buffer; they contributed no annotation.
    pub decode_failures: Vec<DecodeRuleError>,
}

/// Coalescing state. Owned by the receive loop alone.
#[derive(Debug, Default)]
pub struct Coalescer {
    last_flush: Option<Instant>,
    accumulated: Vec<u8>,
    tail: Option<TranscriptEntry>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the current receive run.
    pub fn accumulated(&self) -> &[u8] {
        &self.accumulated
    }

    /// Id of the entry the next continuation would replace.
    #[cfg(test)]
    fn tail_id(&self) -> Option<u64> {
        self.tail.as_ref().map(|e| e.id)
    }

    fn allocate_entry(&self, category: Category, text: String) -> TranscriptEntry {
        TranscriptEntry {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            timestamp: Local::now(),
            category,
            text,
            annotation: String::new(),
        }
    }

    /// Whether a chunk arriving at `now` continues the current run.
    /// A delta equal to the window still counts as a continuation.
    fn continues_run(&self, now: Instant, window: Duration) -> bool {
        match (self.last_flush, &self.tail) {
            (Some(last), Some(_)) => now.saturating_duration_since(last) <= window,
            _ => false,
        }
    }

    /// Feed one received chunk, decode the accumulated run, and return the
    /// transcript change.
    pub fn on_received(
        &mut self,
        chunk: &[u8],
        now: Instant,
        settings: &ReceiveSettings,
        decoders: &DecodePipeline,
    ) -> Received {
        let continuation = self.continues_run(now, settings.gap_window())
            && self.accumulated.len() + chunk.len() <= settings.max_run_bytes;
        self.last_flush = Some(now);

        if continuation {
            self.accumulated.extend_from_slice(chunk);
        } else {
            self.accumulated.clear();
            self.accumulated.extend_from_slice(chunk);
            let entry = self.allocate_entry(Category::Received, String::new());
            self.tail = Some(entry);
        }

        let text = settings.render(&self.accumulated);
        let annotation = decoders.annotate(&self.accumulated);

        let mut entry = match self.tail.take() {
            Some(entry) => entry,
            None => self.allocate_entry(Category::Received, String::new()),
        };
        entry.text = text;
        entry.annotation = annotation.text;
        self.tail = Some(entry.clone());

        let update = if continuation {
            TranscriptUpdate::ReplaceTail(entry)
        } else {
            TranscriptUpdate::Append(entry)
        };
        Received {
            update,
            decode_failures: annotation.failures,
        }
    }

    /// Record sent bytes. Always a new entry; ends any receive run.
    pub fn on_sent(&mut self, data: &[u8], settings: &ReceiveSettings) -> TranscriptUpdate {
        self.reset();
        let entry = self.allocate_entry(Category::Sent, settings.render(data));
        TranscriptUpdate::Append(entry)
    }

    /// Forget the current run (e.g. on close).
    pub fn reset(&mut self) {
        self.last_flush = None;
        self.accumulated.clear();
        self.tail = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::transcript::TranscriptSink;

    fn settings(render: RenderMode, gap_ms: u64) -> ReceiveSettings {
        ReceiveSettings {
            render,
            encoding: TextEncoding::Utf8,
            gap_window_ms: gap_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_close_chunks_merge_into_one_entry() {
        let s = settings(RenderMode::Hex, 20);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let mut sink = TranscriptSink::new(100);
        let t0 = Instant::now();

        let chunks: [&[u8]; 3] = [b"\x01\x02", b"\x03", b"\xAA\xBB"];
        for (i, chunk) in chunks.iter().enumerate() {
            let r = c.on_received(chunk, t0 + Duration::from_millis(10 * i as u64), &s, &pipeline);
            sink.apply(r.update);
        }

        assert_eq!(sink.len(), 1);
        let entry = sink.entries().next().unwrap();
        assert_eq!(entry.category, Category::Received);
        assert_eq!(entry.text, bytes_to_hex(&[0x01, 0x02, 0x03, 0xAA, 0xBB]));
        assert_eq!(entry.text, "01 02 03 AA BB");
    }

    #[test]
    fn test_text_render_is_full_rerender() {
        // A multi-byte character split across chunks only renders once the
        // whole run is decoded together.
        let s = settings(RenderMode::Text, 20);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let t0 = Instant::now();
        let first = c.on_received(&[b'a', 0xE4, 0xB8], t0, &s, &pipeline);
        assert_eq!(first.update.entry().text, "a");
        let second = c.on_received(&[0xAD], t0 + Duration::from_millis(5), &s, &pipeline);
        assert!(matches!(second.update, TranscriptUpdate::ReplaceTail(_)));
        assert_eq!(second.update.entry().text, "a中");
        assert_eq!(first.update.entry().id, second.update.entry().id);
    }

    #[test]
    fn test_gap_exceeding_chunks_start_new_entries() {
        let s = settings(RenderMode::Hex, 20);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let mut sink = TranscriptSink::new(100);
        let t0 = Instant::now();
        // Offsets: two boundaries exceed the window (40 > 20, 100 - 45 > 20).
        for ms in [0u64, 5, 45, 50, 100] {
            let r = c.on_received(b"\x00", t0 + Duration::from_millis(ms), &s, &pipeline);
            sink.apply(r.update);
        }
        assert_eq!(sink.len(), 3);
        let texts: Vec<_> = sink.entries().map(|e| e.text.clone()).collect();
        assert_eq!(texts, vec!["00 00", "00 00", "00"]);
    }

    #[test]
    fn test_delta_equal_to_window_continues() {
        let s = settings(RenderMode::Hex, 20);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let t0 = Instant::now();
        c.on_received(b"\x01", t0, &s, &pipeline);
        let r = c.on_received(b"\x02", t0 + Duration::from_millis(20), &s, &pipeline);
        assert!(matches!(r.update, TranscriptUpdate::ReplaceTail(_)));
        let r = c.on_received(b"\x03", t0 + Duration::from_millis(41), &s, &pipeline);
        assert!(matches!(r.update, TranscriptUpdate::Append(_)));
    }

    #[test]
    fn test_window_measured_from_last_chunk() {
        let s = settings(RenderMode::Hex, 20);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let t0 = Instant::now();
        // Each gap is 15ms; the run spans 60ms but never breaks.
        for i in 0..5u64 {
            c.on_received(b"\x7F", t0 + Duration::from_millis(15 * i), &s, &pipeline);
        }
        assert_eq!(c.accumulated().len(), 5);
    }

    #[test]
    fn test_continuous_stream_is_split_at_max_run_bytes() {
        let s = ReceiveSettings {
            max_run_bytes: 1024,
            ..settings(RenderMode::Hex, 20)
        };
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let mut sink = TranscriptSink::new(100);
        let t0 = Instant::now();
        let chunk = [0x5Au8; 64];

        // Every gap is within the window; only the size cap ends a run.
        for i in 0..200u64 {
            let r = c.on_received(&chunk, t0 + Duration::from_millis(10 * i), &s, &pipeline);
            assert!(c.accumulated().len() <= 1024);
            sink.apply(r.update);
        }

        assert_eq!(sink.len(), 13);
        let sizes: Vec<usize> = sink.entries().map(|e| e.text.split(' ').count()).collect();
        assert!(sizes[..12].iter().all(|&n| n == 1024), "{:?}", sizes);
        assert_eq!(sizes[12], 512);
    }

    #[test]
    fn test_oversized_chunk_gets_its_own_entry() {
        let s = ReceiveSettings {
            max_run_bytes: 4,
            ..settings(RenderMode::Hex, 1000)
        };
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let t0 = Instant::now();
        c.on_received(b"\x01", t0, &s, &pipeline);
        let r = c.on_received(&[0u8; 8], t0, &s, &pipeline);
        assert!(matches!(r.update, TranscriptUpdate::Append(_)));
        assert_eq!(c.accumulated().len(), 8);
        let r = c.on_received(b"\x02", t0, &s, &pipeline);
        assert!(matches!(r.update, TranscriptUpdate::Append(_)));
    }

    #[test]
    fn test_sent_breaks_receive_run() {
        let s = settings(RenderMode::Text, 1000);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let mut sink = TranscriptSink::new(100);
        let t0 = Instant::now();

        sink.apply(c.on_received(b"ab", t0, &s, &pipeline).update);
        let sent = c.on_sent(b"AT\r\n", &s);
        assert_eq!(sent.entry().category, Category::Sent);
        sink.apply(sent);
        assert!(c.accumulated().is_empty());
        assert_eq!(c.tail_id(), None);

        let r = c.on_received(b"cd", t0 + Duration::from_millis(1), &s, &pipeline);
        assert!(matches!(r.update, TranscriptUpdate::Append(_)));
        sink.apply(r.update);

        let tags: Vec<_> = sink.entries().map(|e| e.tag()).collect();
        assert_eq!(tags, vec!["received", "sent", "received"]);
        assert_eq!(sink.entries().last().unwrap().text, "cd");
    }

    #[test]
    fn test_ids_are_monotonic() {
        let s = settings(RenderMode::Hex, 0);
        let pipeline = DecodePipeline::default();
        let mut c = Coalescer::new();
        let t0 = Instant::now();
        let a = c.on_received(b"\x01", t0, &s, &pipeline).update.entry().id;
        let b = c.on_sent(b"\x02", &s).entry().id;
        let d = c
            .on_received(b"\x03", t0 + Duration::from_millis(1), &s, &pipeline)
            .update
            .entry()
            .id;
        assert!(a < b && b < d);
    }
}
