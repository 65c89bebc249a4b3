use std::time::{Duration, Instant};

const MAX_LATENT: usize = 32;
const FLOW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy)]
struct FlowSample {
    size: usize,
    time: Instant,
}

/// Bandwidth estimate over the most recent datagrams in one direction.
#[derive(Debug, Clone)]
pub struct Flow {
    samples: [Option<FlowSample>; MAX_LATENT],
    current: usize,
    next_compute: Option<Instant>,
    kbytes_per_sec: f32,
    avg_kbytes_per_sec: f32,
    total_bytes: u64,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            samples: [None; MAX_LATENT],
            current: 0,
            next_compute: None,
            kbytes_per_sec: 0.0,
            avg_kbytes_per_sec: 0.0,
            total_bytes: 0,
        }
    }
}

impl Flow {
    pub fn record(&mut self, size: usize, now: Instant) {
        self.samples[self.current % MAX_LATENT] = Some(FlowSample { size, time: now });
        self.current += 1;
        self.total_bytes += size as u64;
        self.update(now);
    }

    /// Recomputes the rate at most every 100 ms from the newest half of
    /// the sample window.
    pub fn update(&mut self, now: Instant) {
        if self.next_compute.is_some_and(|at| now < at) {
            return;
        }
        self.next_compute = Some(now + FLOW_INTERVAL);

        let start = self.current.saturating_sub(MAX_LATENT / 2);
        let mut bytes = 0usize;
        let mut elapsed = Duration::ZERO;
        for i in start..self.current.saturating_sub(1) {
            let (Some(prev), Some(next)) = (
                self.samples[i % MAX_LATENT],
                self.samples[(i + 1) % MAX_LATENT],
            ) else {
                continue;
            };
            bytes += prev.size;
            elapsed += next.time.saturating_duration_since(prev.time);
        }

        self.kbytes_per_sec = if elapsed.is_zero() {
            0.0
        } else {
            bytes as f32 / elapsed.as_secs_f32() / 1024.0
        };
        self.avg_kbytes_per_sec = self.avg_kbytes_per_sec * (2.0 / 3.0) + self.kbytes_per_sec / 3.0;
    }

    pub fn kbytes_per_sec(&self) -> f32 {
        self.kbytes_per_sec
    }

    pub fn avg_kbytes_per_sec(&self) -> f32 {
        self.avg_kbytes_per_sec
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Smoothed round trip time from acknowledged sequences.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    sent: [Option<(u32, Instant)>; Self::WINDOW],
    srtt: f32,
    rtt_var: f32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            sent: [None; Self::WINDOW],
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }
}

impl RttEstimator {
    const WINDOW: usize = 64;

    pub fn track(&mut self, sequence: u32, now: Instant) {
        self.sent[sequence as usize % Self::WINDOW] = Some((sequence, now));
    }

    /// Returns the sample in milliseconds when `ack` is still in the window.
    pub fn acknowledge(&mut self, ack: u32, now: Instant) -> Option<f32> {
        let slot = &mut self.sent[ack as usize % Self::WINDOW];
        let (sequence, sent_at) = (*slot)?;
        if sequence != ack {
            return None;
        }
        *slot = None;

        let rtt = now.saturating_duration_since(sent_at).as_secs_f32() * 1000.0;
        self.update_rtt(rtt);
        Some(rtt)
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn rtt_ms(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_variance(&self) -> f32 {
        self.rtt_var
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Body bytes before compression, for the compression ratio.
    pub uncompressed_sent: u64,
    pub uncompressed_received: u64,
    /// Datagrams skipped over by a sequence gap.
    pub packets_dropped: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub reliable_resends: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub unreliable_dropped: u64,
    pub overflows: u64,
    pub chokes: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

impl NetworkStats {
    pub fn packet_loss_percent(&self) -> f32 {
        let expected = self.packets_received + self.packets_dropped;
        if expected == 0 {
            return 0.0;
        }
        self.packets_dropped as f32 * 100.0 / expected as f32
    }

    pub fn compression_ratio(&self) -> f32 {
        if self.bytes_sent == 0 {
            return 1.0;
        }
        self.uncompressed_sent as f32 / self.bytes_sent as f32
    }

    /// Adds another channel's counters. Round-trip figures keep the worst.
    pub fn merge(&mut self, other: &NetworkStats) {
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.uncompressed_sent += other.uncompressed_sent;
        self.uncompressed_received += other.uncompressed_received;
        self.packets_dropped += other.packets_dropped;
        self.duplicates += other.duplicates;
        self.out_of_order += other.out_of_order;
        self.reliable_resends += other.reliable_resends;
        self.fragments_sent += other.fragments_sent;
        self.fragments_received += other.fragments_received;
        self.unreliable_dropped += other.unreliable_dropped;
        self.overflows += other.overflows;
        self.chokes += other.chokes;
        self.rtt_ms = self.rtt_ms.max(other.rtt_ms);
        self.rtt_variance = self.rtt_variance.max(other.rtt_variance);
    }
}
