//! Link-quality statistics
//!
//! Transports hand out raw cumulative counters as [`StatsReport`]s. The
//! aggregator turns successive snapshots into bitrate, loss and round-trip
//! time. Bitrate needs a baseline, so the first sample of any flow reports
//! [`Metric::UNAVAILABLE`]; that is expected and never an error.

use crate::media::MediaKind;
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

/// One entry of a transport statistics snapshot, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatsReport {
    #[serde(rename_all = "camelCase")]
    OutboundRtp {
        kind: MediaKind,
        bytes_sent: u64,
        packets_sent: u64,
        #[serde(default)]
        packets_lost: u64,
    },
    #[serde(rename_all = "camelCase")]
    InboundRtp {
        kind: MediaKind,
        bytes_received: u64,
        packets_received: u64,
        #[serde(default)]
        packets_lost: u64,
    },
    #[serde(rename_all = "camelCase")]
    CandidatePair {
        state: String,
        #[serde(default)]
        nominated: bool,
        /// Seconds
        #[serde(default)]
        current_round_trip_time: Option<f64>,
    },
}

/// Numeric value or unavailable; displays `-` when unavailable
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metric(Option<f64>);

impl Metric {
    pub const UNAVAILABLE: Self = Self(None);

    /// Non-finite values are treated as unavailable
    #[must_use]
    pub fn value(v: f64) -> Self {
        if v.is_finite() {
            Self(Some(v))
        } else {
            Self::UNAVAILABLE
        }
    }

    #[must_use]
    pub const fn get(&self) -> Option<f64> {
        self.0
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v:.1}"),
            None => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct KindTelemetry {
    pub bitrate_kbps: Metric,
    pub loss_percent: Metric,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OutboundTelemetry {
    pub video: KindTelemetry,
    pub audio: KindTelemetry,
    /// Shared by both kinds
    pub rtt_ms: Metric,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PeerTelemetry {
    pub video: KindTelemetry,
    pub audio: KindTelemetry,
    pub rtt_ms: Metric,
}

/// Everything the UI shows, published once per polling interval
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub outbound: OutboundTelemetry,
    pub peers: BTreeMap<PeerId, PeerTelemetry>,
}

/// Cumulative counters of one logical flow, summed across encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowTotals {
    pub bytes: u64,
    pub packets: u64,
    pub lost: u64,
}

impl FlowTotals {
    fn add(&mut self, bytes: u64, packets: u64, lost: u64) {
        self.bytes = self.bytes.saturating_add(bytes);
        self.packets = self.packets.saturating_add(packets);
        self.lost = self.lost.saturating_add(lost);
    }

    /// `lost / (lost + packets)` over cumulative totals, as a percentage
    #[must_use]
    pub fn loss_percent(&self) -> Metric {
        let total = self.lost.saturating_add(self.packets);
        if total == 0 {
            return Metric::UNAVAILABLE;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.lost as f64 / total as f64;
        Metric::value(ratio * 100.0)
    }
}

/// Sum outbound counters per kind
#[must_use]
pub fn outbound_totals(reports: &[StatsReport]) -> HashMap<MediaKind, FlowTotals> {
    let mut totals: HashMap<MediaKind, FlowTotals> = HashMap::new();
    for report in reports {
        if let StatsReport::OutboundRtp {
            kind,
            bytes_sent,
            packets_sent,
            packets_lost,
        } = report
        {
            totals
                .entry(*kind)
                .or_default()
                .add(*bytes_sent, *packets_sent, *packets_lost);
        }
    }
    totals
}

/// Sum inbound counters per kind
#[must_use]
pub fn inbound_totals(reports: &[StatsReport]) -> HashMap<MediaKind, FlowTotals> {
    let mut totals: HashMap<MediaKind, FlowTotals> = HashMap::new();
    for report in reports {
        if let StatsReport::InboundRtp {
            kind,
            bytes_received,
            packets_received,
            packets_lost,
        } = report
        {
            totals
                .entry(*kind)
                .or_default()
                .add(*bytes_received, *packets_received, *packets_lost);
        }
    }
    totals
}

/// Round-trip time of the active candidate pair, in milliseconds.
///
/// Prefers a nominated, succeeded pair and falls back to any pair reporting a
/// measurement.
#[must_use]
pub fn round_trip_ms(reports: &[StatsReport]) -> Metric {
    let mut fallback = None;
    for report in reports {
        if let StatsReport::CandidatePair {
            state,
            nominated,
            current_round_trip_time: Some(rtt),
        } = report
        {
            if *nominated && state == "succeeded" {
                return Metric::value(rtt * 1000.0);
            }
            fallback.get_or_insert(*rtt);
        }
    }
    fallback.map_or(Metric::UNAVAILABLE, |rtt| Metric::value(rtt * 1000.0))
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    bytes: u64,
    at: Instant,
}

/// Delta-bitrate state for one flow
#[derive(Debug, Default)]
struct KindMeter {
    previous: Option<Baseline>,
}

impl KindMeter {
    fn update(&mut self, totals: Option<FlowTotals>, now: Instant) -> KindTelemetry {
        let Some(totals) = totals else {
            self.previous = None;
            return KindTelemetry::default();
        };

        let bitrate_kbps = match self.previous {
            Some(prev) if totals.bytes >= prev.bytes && now > prev.at => {
                let secs = now.duration_since(prev.at).as_secs_f64();
                #[allow(clippy::cast_precision_loss)]
                let bits = (totals.bytes - prev.bytes) as f64 * 8.0;
                Metric::value(bits / secs / 1000.0)
            }
            _ => Metric::UNAVAILABLE,
        };

        self.previous = Some(Baseline {
            bytes: totals.bytes,
            at: now,
        });

        KindTelemetry {
            bitrate_kbps,
            loss_percent: totals.loss_percent(),
        }
    }
}

/// Keeps per-flow baselines between polls.
///
/// Outbound flows are keyed by kind, inbound flows by (peer, kind), so one
/// peer's baseline never leaks into another's.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    outbound: HashMap<MediaKind, KindMeter>,
    inbound: HashMap<(PeerId, MediaKind), KindMeter>,
}

impl StatsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_outbound(&mut self, reports: &[StatsReport], now: Instant) -> OutboundTelemetry {
        let mut totals = outbound_totals(reports);
        let mut measure = |kind: MediaKind| {
            self.outbound
                .entry(kind)
                .or_default()
                .update(totals.remove(&kind), now)
        };
        OutboundTelemetry {
            video: measure(MediaKind::Video),
            audio: measure(MediaKind::Audio),
            rtt_ms: round_trip_ms(reports),
        }
    }

    pub fn sample_peer(
        &mut self,
        peer_id: &PeerId,
        reports: &[StatsReport],
        now: Instant,
    ) -> PeerTelemetry {
        let mut totals = inbound_totals(reports);
        let mut measure = |kind: MediaKind| {
            self.inbound
                .entry((peer_id.clone(), kind))
                .or_default()
                .update(totals.remove(&kind), now)
        };
        PeerTelemetry {
            video: measure(MediaKind::Video),
            audio: measure(MediaKind::Audio),
            rtt_ms: round_trip_ms(reports),
        }
    }

    /// Drop every baseline of a departed peer
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        self.inbound.retain(|(peer, _), _| peer != peer_id);
    }

    #[must_use]
    pub fn has_baseline_for(&self, peer_id: &PeerId) -> bool {
        self.inbound.keys().any(|(peer, _)| peer == peer_id)
    }

    pub fn reset(&mut self) {
        self.outbound.clear();
        self.inbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn outbound(kind: MediaKind, bytes: u64, packets: u64, lost: u64) -> StatsReport {
        StatsReport::OutboundRtp {
            kind,
            bytes_sent: bytes,
            packets_sent: packets,
            packets_lost: lost,
        }
    }

    fn inbound(kind: MediaKind, bytes: u64, packets: u64) -> StatsReport {
        StatsReport::InboundRtp {
            kind,
            bytes_received: bytes,
            packets_received: packets,
            packets_lost: 0,
        }
    }

    #[test]
    fn test_report_is_tagged_by_type() {
        let report: StatsReport = serde_json::from_value(json!({
            "type": "outbound-rtp",
            "kind": "video",
            "bytesSent": 1200,
            "packetsSent": 10
        }))
        .unwrap();
        assert_eq!(report, outbound(MediaKind::Video, 1200, 10, 0));

        let pair: StatsReport = serde_json::from_value(json!({
            "type": "candidate-pair",
            "state": "succeeded",
            "nominated": true,
            "currentRoundTripTime": 0.042
        }))
        .unwrap();
        assert!(matches!(pair, StatsReport::CandidatePair { nominated: true, .. }));
    }

    #[test]
    fn test_metric_display() {
        assert_eq!(Metric::UNAVAILABLE.to_string(), "-");
        assert_eq!(Metric::value(12.345).to_string(), "12.3");
        assert!(!Metric::value(f64::NAN).is_available());
    }

    #[test]
    fn test_bitrate_unavailable_then_finite() {
        let mut aggregator = StatsAggregator::new();
        let start = Instant::now();

        let first = aggregator.sample_outbound(&[outbound(MediaKind::Video, 10_000, 10, 0)], start);
        assert!(!first.video.bitrate_kbps.is_available());

        let second = aggregator.sample_outbound(
            &[outbound(MediaKind::Video, 135_000, 110, 0)],
            start + Duration::from_secs(1),
        );
        let kbps = second.video.bitrate_kbps.get().unwrap();
        assert!(kbps.is_finite() && kbps >= 0.0);
        assert!((kbps - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_loss_uses_cumulative_totals() {
        let mut aggregator = StatsAggregator::new();
        let sample = aggregator.sample_outbound(
            &[outbound(MediaKind::Audio, 500, 95, 5)],
            Instant::now(),
        );
        assert!((sample.audio.loss_percent.get().unwrap() - 5.0).abs() < 1e-9);
        assert!(!sample.video.loss_percent.is_available());
    }

    #[test]
    fn test_inbound_flows_are_summed_per_kind() {
        let mut aggregator = StatsAggregator::new();
        let peer = PeerId::from("b");
        let start = Instant::now();

        aggregator.sample_peer(
            &peer,
            &[inbound(MediaKind::Video, 1_000, 1), inbound(MediaKind::Video, 1_000, 1)],
            start,
        );
        let second = aggregator.sample_peer(
            &peer,
            &[inbound(MediaKind::Video, 6_000, 6), inbound(MediaKind::Video, 6_000, 6)],
            start + Duration::from_secs(2),
        );
        // (12000 - 2000) bytes over 2s
        assert!((second.video.bitrate_kbps.get().unwrap() - 40.0).abs() < 1e-6);
        assert!(!second.audio.bitrate_kbps.is_available());
    }

    #[test]
    fn test_peer_baselines_are_independent() {
        let mut aggregator = StatsAggregator::new();
        let start = Instant::now();
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        aggregator.sample_peer(&a, &[inbound(MediaKind::Audio, 1_000, 10)], start);
        let b_first = aggregator.sample_peer(
            &b,
            &[inbound(MediaKind::Audio, 9_000, 90)],
            start + Duration::from_secs(1),
        );
        assert!(!b_first.audio.bitrate_kbps.is_available());

        aggregator.forget_peer(&a);
        assert!(!aggregator.has_baseline_for(&a));
        assert!(aggregator.has_baseline_for(&b));
    }

    #[test]
    fn test_counter_reset_yields_unavailable() {
        let mut aggregator = StatsAggregator::new();
        let start = Instant::now();
        aggregator.sample_outbound(&[outbound(MediaKind::Video, 50_000, 50, 0)], start);
        let after_reset = aggregator.sample_outbound(
            &[outbound(MediaKind::Video, 100, 1, 0)],
            start + Duration::from_secs(1),
        );
        assert!(!after_reset.video.bitrate_kbps.is_available());
    }

    #[test]
    fn test_round_trip_prefers_nominated_pair() {
        let reports = [
            StatsReport::CandidatePair {
                state: "in-progress".to_string(),
                nominated: false,
                current_round_trip_time: Some(0.5),
            },
            StatsReport::CandidatePair {
                state: "succeeded".to_string(),
                nominated: true,
                current_round_trip_time: Some(0.02),
            },
        ];
        assert!((round_trip_ms(&reports).get().unwrap() - 20.0).abs() < 1e-9);
        assert!(!round_trip_ms(&[]).is_available());
    }
}
