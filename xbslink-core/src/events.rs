//! Structured event emission for diagnostics.
//!
//! Events are fire-and-forget: emission never blocks the bridge, and write
//! errors are silently dropped. Each event is one JSON object per line:
//! `{"type": ..., "timestamp": <rfc3339>, "data": {...}}`.
//!
//! [`JsonLineWriter`] writes inline and is for callers that can afford the
//! I/O; [`AsyncJsonLineWriter`] queues to a bounded channel drained by a
//! dedicated writer thread, so `emit` from a bridge worker never stalls on
//! a slow file or pipe.

use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Queue depth for [`AsyncJsonLineWriter`]. A full queue drops events.
const EVENT_QUEUE_CAPACITY: usize = 64;

/// One diagnostic event with its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    StateChanged {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_addr: Option<String>,
    },
    Stats {
        tx_packets: u64,
        tx_bytes: u64,
        rx_packets: u64,
        rx_bytes: u64,
        rtt_current_ms: f64,
        rtt_avg_ms: f64,
    },
    Latency {
        rtt_ms: f64,
        is_spike: bool,
        exceeds_threshold: bool,
    },
    Discovery {
        mac: String,
    },
    Error {
        message: String,
    },
}

impl Event {
    /// The envelope `type` field value.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::StateChanged { .. } => "state_changed",
            Event::Stats { .. } => "stats",
            Event::Latency { .. } => "latency",
            Event::Discovery { .. } => "discovery",
            Event::Error { .. } => "error",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    data: &'a Event,
}

/// Sink for diagnostic events.
pub trait Emitter: Send + Sync {
    fn emit(&self, event: Event);
}

/// Discards all events.
pub struct NopEmitter;

impl Emitter for NopEmitter {
    fn emit(&self, _event: Event) {}
}

/// Writes JSON Lines to any writer. Safe for concurrent use.
pub struct JsonLineWriter {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLineWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl Emitter for JsonLineWriter {
    fn emit(&self, event: Event) {
        let envelope = Envelope {
            event_type: event.event_type(),
            timestamp: Utc::now(),
            data: &event,
        };

        // Events are diagnostic, not critical: drop on any failure.
        let Ok(line) = serde_json::to_vec(&envelope) else {
            return;
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let _ = writer.write_all(&line);
        let _ = writer.write_all(b"\n");
        let _ = writer.flush();
    }
}

/// Non-blocking emitter: events go into a bounded queue and a dedicated
/// thread does the actual writing. A full queue drops the event immediately,
/// the same policy the bridge applies to its frame channels.
///
/// Dropping the emitter closes the queue; the writer thread drains whatever
/// is still buffered and exits.
pub struct AsyncJsonLineWriter {
    queue: mpsc::Sender<Event>,
}

impl AsyncJsonLineWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        let (queue, mut events) = mpsc::channel::<Event>(EVENT_QUEUE_CAPACITY);
        std::thread::spawn(move || {
            let writer = JsonLineWriter::new(writer);
            while let Some(event) = events.blocking_recv() {
                writer.emit(event);
            }
        });
        Self { queue }
    }
}

impl Emitter for AsyncJsonLineWriter {
    fn emit(&self, event: Event) {
        // Never block the caller: a full or closed queue drops the event.
        let _ = self.queue.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buf lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let raw = self.0.lock().expect("buf lock").clone();
            String::from_utf8(raw)
                .expect("utf8")
                .lines()
                .map(|l| serde_json::from_str(l).expect("json line"))
                .collect()
        }
    }

    #[test]
    fn emit_writes_one_json_line() {
        let buf = SharedBuf::default();
        let writer = JsonLineWriter::new(Box::new(buf.clone()));

        writer.emit(Event::Discovery {
            mac: "00:50:f2:1a:2b:3c".to_string(),
        });

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "discovery");
        assert_eq!(lines[0]["data"]["mac"], "00:50:f2:1a:2b:3c");
        assert!(lines[0]["timestamp"].is_string());
    }

    #[test]
    fn emit_multiple_events_in_order() {
        let buf = SharedBuf::default();
        let writer = JsonLineWriter::new(Box::new(buf.clone()));

        writer.emit(Event::StateChanged {
            state: "CONNECTED".to_string(),
            peer_addr: Some("127.0.0.1:31415".to_string()),
        });
        writer.emit(Event::Latency {
            rtt_ms: 42.5,
            is_spike: true,
            exceeds_threshold: true,
        });
        writer.emit(Event::Error {
            message: "boom".to_string(),
        });

        let lines = buf.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "state_changed");
        assert_eq!(lines[0]["data"]["state"], "CONNECTED");
        assert_eq!(lines[0]["data"]["peer_addr"], "127.0.0.1:31415");
        assert_eq!(lines[1]["type"], "latency");
        assert_eq!(lines[1]["data"]["rtt_ms"], 42.5);
        assert_eq!(lines[2]["type"], "error");
        assert_eq!(lines[2]["data"]["message"], "boom");
    }

    #[test]
    fn state_changed_omits_missing_peer() {
        let buf = SharedBuf::default();
        let writer = JsonLineWriter::new(Box::new(buf.clone()));

        writer.emit(Event::StateChanged {
            state: "DISCONNECTED".to_string(),
            peer_addr: None,
        });

        let lines = buf.lines();
        assert!(lines[0]["data"].get("peer_addr").is_none());
    }

    #[test]
    fn stats_event_payload() {
        let buf = SharedBuf::default();
        let writer = JsonLineWriter::new(Box::new(buf.clone()));

        writer.emit(Event::Stats {
            tx_packets: 10,
            tx_bytes: 1024,
            rx_packets: 7,
            rx_bytes: 512,
            rtt_current_ms: 3.5,
            rtt_avg_ms: 4.0,
        });

        let lines = buf.lines();
        assert_eq!(lines[0]["data"]["tx_packets"], 10);
        assert_eq!(lines[0]["data"]["rx_bytes"], 512);
        assert_eq!(lines[0]["data"]["rtt_avg_ms"], 4.0);
    }

    fn wait_for_lines(buf: &SharedBuf, count: usize) -> Vec<serde_json::Value> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            let lines = buf.lines();
            if lines.len() >= count {
                return lines;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        buf.lines()
    }

    #[test]
    fn async_writer_delivers_in_order() {
        let buf = SharedBuf::default();
        let writer = AsyncJsonLineWriter::new(Box::new(buf.clone()));

        writer.emit(Event::StateChanged {
            state: "CONNECTING".to_string(),
            peer_addr: None,
        });
        writer.emit(Event::Discovery {
            mac: "00:50:f2:1a:2b:3c".to_string(),
        });

        let lines = wait_for_lines(&buf, 2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "state_changed");
        assert_eq!(lines[1]["type"], "discovery");
    }

    #[test]
    fn async_writer_drains_on_drop() {
        let buf = SharedBuf::default();
        let writer = AsyncJsonLineWriter::new(Box::new(buf.clone()));

        for i in 0..10 {
            writer.emit(Event::Error {
                message: format!("event {i}"),
            });
        }
        drop(writer);

        let lines = wait_for_lines(&buf, 10);
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[9]["data"]["message"], "event 9");
    }

    #[test]
    fn nop_emitter_accepts_everything() {
        let emitter = NopEmitter;
        emitter.emit(Event::Error {
            message: "ignored".to_string(),
        });
    }
}
