//! Push delivery over server-sent events.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::state::ChatMessage;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Opens the raw `text/event-stream` body for a session.
#[async_trait]
pub trait EventStreamOpener: Send + Sync {
    async fn open(&self, session_id: &str) -> Result<ByteStream>;
}

#[derive(Debug)]
pub enum PushEvent {
    Connected,
    Entries(Vec<ChatMessage>),
    Disconnected,
}

/// Longest line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental event-stream decoder. Yields the `data` payload of every
/// complete event; comment lines (keep-alives) are dropped.
///
/// A line longer than the cap is discarded up to its newline along with the
/// event it belongs to.
#[derive(Debug)]
pub struct SseParser {
    buffer: String,
    pending: Vec<u8>,
    data: Vec<String>,
    max_line: usize,
    skipping: bool,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: String::new(),
            pending: Vec::new(),
            data: Vec::new(),
            max_line,
            skipping: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        // chunks may split a multi-byte character
        self.pending.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        if self.skipping {
            match self.buffer.find('\n') {
                Some(pos) => {
                    self.buffer.drain(..=pos);
                    self.skipping = false;
                }
                None => {
                    self.buffer.clear();
                    return Vec::new();
                }
            }
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        if self.buffer.len() > self.max_line {
            log::warn!("Dropping event-stream line over {} bytes", self.max_line);
            self.buffer.clear();
            self.data.clear();
            self.skipping = true;
        }
        events
    }
}

/// Decodes one event payload: a single message object or an array of them.
pub fn parse_push_payload(data: &str) -> Vec<ChatMessage> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Ignoring malformed push payload: {}", e);
            return Vec::new();
        }
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ChatMessage>(item) {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("Skipping pushed entry: {}", e);
                None
            }
        })
        .collect()
}

/// Exponential reconnect delay, reset after a successful connection.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

#[derive(Clone)]
pub struct PushSource {
    opener: Arc<dyn EventStreamOpener>,
    reconnect: ReconnectPolicy,
}

impl PushSource {
    pub fn new(opener: Arc<dyn EventStreamOpener>) -> Self {
        Self {
            opener,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Keeps a stream open for `session_id` until `tx` is closed.
    pub fn spawn(&self, session_id: String, tx: mpsc::UnboundedSender<PushEvent>) -> JoinHandle<()> {
        let opener = self.opener.clone();
        let reconnect = self.reconnect;

        tokio::spawn(async move {
            let mut delay = reconnect.initial;
            loop {
                match opener.open(&session_id).await {
                    Ok(mut stream) => {
                        log::info!("Message stream connected for session {}", session_id);
                        delay = reconnect.initial;
                        if tx.send(PushEvent::Connected).is_err() {
                            return;
                        }

                        let mut parser = SseParser::new();
                        while let Some(chunk) = stream.next().await {
                            let chunk = match chunk {
                                Ok(chunk) => chunk,
                                Err(e) => {
                                    log::warn!("Message stream error: {}", e);
                                    break;
                                }
                            };
                            for data in parser.feed(&chunk) {
                                let entries = parse_push_payload(&data);
                                if !entries.is_empty() && tx.send(PushEvent::Entries(entries)).is_err() {
                                    return;
                                }
                            }
                        }

                        if tx.send(PushEvent::Disconnected).is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("Failed to open message stream: {}", e),
                }

                if tx.is_closed() {
                    return;
                }
                log::debug!("Reconnecting message stream in {:?}", delay);
                tokio::time::sleep(delay).await;
                delay = reconnect.next_delay(delay);
            }
        })
    }
}
