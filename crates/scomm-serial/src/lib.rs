//! # scomm – Serial terminal core
//!
//! Everything below the presentation layer of the serial debugging
//! assistant:
//!
//! - **Transport** – open/close a byte-stream device (8N1, configurable baud
//!   and timeouts), bounded-wait reads, best-effort writes, RTS/DTR lines
//! - **Outbound queue** – payloads built from text or hex input with optional
//!   CR/LF, cached for repeat sends, with one-shot control-line overrides
//! - **Coalescer** – merges closely spaced receive chunks into one transcript
//!   entry and renders it as hex or decoded text
//! - **Decode rules** – a sandboxed expression language evaluated against each
//!   coalesced receive buffer
//! - **Transcript** – bounded, append-only log with plain-text export
//! - **Scheduler** – receive, periodic-send and port-scan loops with
//!   cooperative cancellation
//! - **Config** – the flat JSON configuration file with typed accessors

pub mod serial;
