//! Bridge statistics: traffic counters and RTT tracking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Sliding window size for RTT averaging.
pub const RTT_WINDOW: usize = 20;

/// RTT above which System Link play degrades noticeably.
pub const RTT_ALERT_THRESHOLD: Duration = Duration::from_millis(30);

/// Fractional increase over the previous RTT that counts as a spike.
pub const RTT_SPIKE_RATIO: f64 = 0.5;

/// Outcome of recording one RTT sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttReport {
    pub rtt: Duration,
    pub avg: Duration,
    /// Set when the new sample exceeds the previous one by more than
    /// [`RTT_SPIKE_RATIO`]; carries (previous, new).
    pub spike: Option<(Duration, Duration)>,
    /// True when the sample exceeds [`RTT_ALERT_THRESHOLD`].
    pub exceeds_threshold: bool,
}

/// Point-in-time view of the counters and RTT state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rtt_current: Duration,
    pub rtt_avg: Duration,
}

#[derive(Default)]
struct RttWindow {
    samples: VecDeque<Duration>,
    sum: Duration,
    current: Duration,
    avg: Duration,
    last: Duration,
}

/// Cumulative bridge statistics. Counters are atomic so every worker can
/// update them; the RTT window is mutex-guarded (one sample every few
/// seconds in steady state).
#[derive(Default)]
pub struct Stats {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rtt: Mutex<RttWindow>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn tx_packets(&self) -> u64 {
        self.tx_packets.load(Ordering::Relaxed)
    }

    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    /// Records one RTT sample in the sliding window, reporting spikes and
    /// threshold crossings. The window keeps a running sum: advancing it
    /// subtracts the evicted sample.
    pub fn add_rtt_sample(&self, rtt: Duration) -> RttReport {
        let mut window = self.rtt.lock().expect("rtt lock");

        let had_previous = !window.samples.is_empty();
        window.last = window.current;
        window.current = rtt;

        window.samples.push_back(rtt);
        window.sum += rtt;
        if window.samples.len() > RTT_WINDOW {
            if let Some(evicted) = window.samples.pop_front() {
                window.sum = window.sum.saturating_sub(evicted);
            }
        }
        window.avg = window.sum / window.samples.len() as u32;

        let spike = if had_previous && !window.last.is_zero() {
            let last = window.last.as_secs_f64();
            let grew = rtt.as_secs_f64() - last;
            (grew > last * RTT_SPIKE_RATIO).then_some((window.last, rtt))
        } else {
            None
        };

        RttReport {
            rtt,
            avg: window.avg,
            spike,
            exceeds_threshold: rtt > RTT_ALERT_THRESHOLD,
        }
    }

    pub fn rtt_current(&self) -> Duration {
        self.rtt.lock().expect("rtt lock").current
    }

    pub fn rtt_avg(&self) -> Duration {
        self.rtt.lock().expect("rtt lock").avg
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let window = self.rtt.lock().expect("rtt lock");
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rtt_current: window.current,
            rtt_avg: window.avg,
        }
    }
}

impl StatsSnapshot {
    /// The periodic stats line:
    /// `TX: <pkts> pkts (<bytes>) | RX: <pkts> pkts (<bytes>) | RTT: <ms>`.
    pub fn format_line(&self) -> String {
        format!(
            "TX: {} pkts ({}) | RX: {} pkts ({}) | RTT: {}ms",
            format_count(self.tx_packets),
            format_bytes(self.tx_bytes),
            format_count(self.rx_packets),
            format_bytes(self.rx_bytes),
            self.rtt_current.as_millis(),
        )
    }
}

/// Formats a number with thousands separators: 1234567 -> "1,234,567".
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Formats a byte count with binary scaling: B, KB (integer), MB and GB
/// (one decimal).
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{} KB", bytes / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.record_tx(100);
        stats.record_tx(50);
        stats.record_rx(200);

        let snap = stats.snapshot();
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_bytes, 150);
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, 200);
    }

    #[test]
    fn counters_monotone_under_concurrency() {
        let stats = Arc::new(Stats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record_tx(10);
                    stats.record_rx(20);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let snap = stats.snapshot();
        assert_eq!(snap.tx_packets, 8000);
        assert_eq!(snap.tx_bytes, 80_000);
        assert_eq!(snap.rx_packets, 8000);
        assert_eq!(snap.rx_bytes, 160_000);
    }

    #[test]
    fn rtt_average_over_window() {
        let stats = Stats::new();
        stats.add_rtt_sample(Duration::from_millis(10));
        stats.add_rtt_sample(Duration::from_millis(20));
        stats.add_rtt_sample(Duration::from_millis(30));

        assert_eq!(stats.rtt_current(), Duration::from_millis(30));
        assert_eq!(stats.rtt_avg(), Duration::from_millis(20));
    }

    #[test]
    fn rtt_window_slides_at_capacity() {
        let stats = Stats::new();
        // Fill the window with 10ms samples, then push higher ones. Once the
        // early samples are evicted the average must follow the recent ones.
        for _ in 0..RTT_WINDOW {
            stats.add_rtt_sample(Duration::from_millis(10));
        }
        for _ in 0..RTT_WINDOW {
            stats.add_rtt_sample(Duration::from_millis(50));
        }
        assert_eq!(stats.rtt_avg(), Duration::from_millis(50));
    }

    #[test]
    fn rtt_spike_detected() {
        let stats = Stats::new();
        let first = stats.add_rtt_sample(Duration::from_millis(10));
        assert_eq!(first.spike, None);

        // 10ms -> 16ms is a 60% jump, above the 50% ratio.
        let report = stats.add_rtt_sample(Duration::from_millis(16));
        assert_eq!(
            report.spike,
            Some((Duration::from_millis(10), Duration::from_millis(16)))
        );
    }

    #[test]
    fn rtt_no_spike_within_ratio() {
        let stats = Stats::new();
        stats.add_rtt_sample(Duration::from_millis(10));
        let report = stats.add_rtt_sample(Duration::from_millis(14));
        assert_eq!(report.spike, None);
    }

    #[test]
    fn rtt_threshold_alert() {
        let stats = Stats::new();
        assert!(!stats.add_rtt_sample(Duration::from_millis(30)).exceeds_threshold);
        assert!(stats.add_rtt_sample(Duration::from_millis(31)).exceeds_threshold);
    }

    #[test]
    fn format_count_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(1_234_567), "1,234,567");
        assert_eq!(format_count(1_000_000_000), "1,000,000,000");
    }

    #[test]
    fn format_bytes_scaling() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1 KB");
        assert_eq!(format_bytes(1024 * 1023), "1023 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0 GB");
        assert_eq!(format_bytes(1536 * 1024 * 1024), "1.5 GB");
    }

    #[test]
    fn stats_line_format() {
        let stats = Stats::new();
        stats.record_tx(2048);
        stats.record_rx(100);
        stats.add_rtt_sample(Duration::from_millis(7));

        let line = stats.snapshot().format_line();
        assert_eq!(line, "TX: 1 pkts (2 KB) | RX: 1 pkts (100 B) | RTT: 7ms");
    }
}
