//! Network quality estimation from heartbeat round-trips
//!
//! Every heartbeat ping is tracked until its pong comes back; the
//! round-trip time feeds a rolling window whose average is classified
//! into quality bands. Band changes are edge-triggered: consumers are
//! only told when the classification actually moves. Measurement is
//! best-effort and never gates message delivery; lost probes simply age
//! out.

use std::collections::{HashMap, VecDeque};

use crate::types::MessageId;

/// Probes unanswered for this long are presumed lost and pruned.
pub const PING_EXPIRY_MS: i64 = 10_000;

/// Rolling window length for the latency average.
pub const LATENCY_WINDOW: usize = 10;

/// Quality bands for the rolling average round-trip latency.
///
/// Thresholds assume relayed delivery through the shared log, not a
/// direct peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    /// No samples yet
    Unknown,
    /// Average below 250 ms
    Excellent,
    /// Average below 800 ms
    Good,
    /// Average below 1500 ms
    Fair,
    /// Everything slower
    Poor,
}

impl NetworkQuality {
    /// Classify an average latency in milliseconds.
    pub fn from_avg_ms(avg: f64) -> Self {
        if avg < 250.0 {
            NetworkQuality::Excellent
        } else if avg < 800.0 {
            NetworkQuality::Good
        } else if avg < 1500.0 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkQuality::Unknown => "unknown",
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
        };
        write!(f, "{}", s)
    }
}

/// Tracks in-flight probes and the latency window for one session.
#[derive(Debug)]
pub struct QualityEstimator {
    /// Probe id -> send time (ms)
    pending: HashMap<MessageId, i64>,
    /// Last [`LATENCY_WINDOW`] round-trip times, ms
    history: VecDeque<i64>,
    quality: NetworkQuality,
}

impl Default for QualityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityEstimator {
    /// Create an estimator with no samples.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            history: VecDeque::with_capacity(LATENCY_WINDOW),
            quality: NetworkQuality::Unknown,
        }
    }

    /// Record an outgoing probe, pruning probes past [`PING_EXPIRY_MS`].
    pub fn record_ping(&mut self, id: MessageId, now: i64) {
        self.pending.retain(|_, sent| now - *sent <= PING_EXPIRY_MS);
        self.pending.insert(id, now);
    }

    /// Record a probe reply.
    ///
    /// Returns `Some((quality, avg))` only when the band changed:
    /// edge-triggered, matching how consumers surface it. Replies to
    /// unknown or expired probes are ignored.
    pub fn record_pong(&mut self, ping_id: &MessageId, now: i64) -> Option<(NetworkQuality, i64)> {
        let sent = self.pending.remove(ping_id)?;
        let latency = now - sent;

        self.history.push_back(latency);
        if self.history.len() > LATENCY_WINDOW {
            self.history.pop_front();
        }

        let avg = self.average()?;
        let quality = NetworkQuality::from_avg_ms(avg as f64);
        if quality != self.quality {
            self.quality = quality;
            Some((quality, avg))
        } else {
            None
        }
    }

    /// Rolling average latency in ms, if any samples exist.
    pub fn average(&self) -> Option<i64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<i64>() / self.history.len() as i64)
    }

    /// Current quality band.
    pub fn quality(&self) -> NetworkQuality {
        self.quality
    }

    /// Number of samples in the window.
    pub fn samples(&self) -> usize {
        self.history.len()
    }

    /// Number of in-flight probes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed one ping/pong with the given round-trip, returning any band
    /// change.
    fn feed(est: &mut QualityEstimator, latency: i64, at: i64) -> Option<(NetworkQuality, i64)> {
        let id = MessageId::new();
        est.record_ping(id, at);
        est.record_pong(&id, at + latency)
    }

    #[test]
    fn test_banding_thresholds() {
        assert_eq!(NetworkQuality::from_avg_ms(100.0), NetworkQuality::Excellent);
        assert_eq!(NetworkQuality::from_avg_ms(250.0), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_avg_ms(799.0), NetworkQuality::Good);
        assert_eq!(NetworkQuality::from_avg_ms(800.0), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::from_avg_ms(1499.0), NetworkQuality::Fair);
        assert_eq!(NetworkQuality::from_avg_ms(1500.0), NetworkQuality::Poor);
    }

    #[test]
    fn test_low_samples_classify_excellent() {
        let mut est = QualityEstimator::new();
        let mut changes = 0;
        for (i, latency) in [100, 120, 90].into_iter().enumerate() {
            if feed(&mut est, latency, (i as i64) * 1_000).is_some() {
                changes += 1;
            }
        }
        assert_eq!(est.quality(), NetworkQuality::Excellent);
        assert_eq!(est.average(), Some(103));
        // Unknown -> Excellent fired exactly once
        assert_eq!(changes, 1);
    }

    #[test]
    fn test_degradation_reaches_poor_and_fires_once() {
        let mut est = QualityEstimator::new();
        let mut at = 0;
        for latency in [100, 120, 90] {
            feed(&mut est, latency, at);
            at += 1_000;
        }

        // Slow samples roll the fast ones out of the window; the
        // average climbs through the bands and settles above 1500.
        let mut poor_changes = 0;
        for _ in 0..LATENCY_WINDOW {
            if let Some((q, _)) = feed(&mut est, 1_600, at) {
                if q == NetworkQuality::Poor {
                    poor_changes += 1;
                }
            }
            at += 1_000;
        }

        assert_eq!(est.quality(), NetworkQuality::Poor);
        assert_eq!(est.average(), Some(1_600));
        // Edge-triggered: the poor band was announced exactly once
        assert_eq!(poor_changes, 1);
    }

    #[test]
    fn test_steady_band_emits_nothing() {
        let mut est = QualityEstimator::new();
        assert!(feed(&mut est, 100, 0).is_some()); // Unknown -> Excellent
        assert!(feed(&mut est, 110, 1_000).is_none());
        assert!(feed(&mut est, 95, 2_000).is_none());
    }

    #[test]
    fn test_window_caps_at_ten() {
        let mut est = QualityEstimator::new();
        for i in 0..15 {
            feed(&mut est, 100 + i, i * 1_000);
        }
        assert_eq!(est.samples(), LATENCY_WINDOW);
    }

    #[test]
    fn test_unknown_pong_ignored() {
        let mut est = QualityEstimator::new();
        assert!(est.record_pong(&MessageId::new(), 1_000).is_none());
        assert_eq!(est.samples(), 0);
    }

    #[test]
    fn test_expired_probes_pruned() {
        let mut est = QualityEstimator::new();
        let old = MessageId::new();
        est.record_ping(old, 0);

        // A new probe past the expiry prunes the old one
        est.record_ping(MessageId::new(), PING_EXPIRY_MS + 1);
        assert_eq!(est.pending_count(), 1);
        assert!(est.record_pong(&old, PING_EXPIRY_MS + 2).is_none());
    }
}
