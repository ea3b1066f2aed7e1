//! Weighted voting combiner.
//!
//! Each discrimination method contributes a sum-typed vote; methods never
//! consult each other. Weights depend on the minute of the hour, since the
//! broadcast schedule makes different methods authoritative at different
//! times (440 Hz station ID on minutes 1 and 2, BCD-rich minutes, and the
//! plain tone-power default everywhere else).

use serde::Serialize;

use crate::config::VotingConfig;
use crate::station::{WWVH_440_MINUTE, WWV_440_MINUTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VoteKind {
    Bcd,
    TonePower,
    TickSnr,
    Tone440,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VoteStation {
    Wwv,
    Wwvh,
}

/// One method's vote: a station, a weight, and the margin that earned it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MethodVote {
    pub kind: VoteKind,
    /// `None` when the method saw both stations as balanced.
    pub station: Option<VoteStation>,
    pub weight: f64,
    pub margin_db: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dominance {
    Wwv,
    Wwvh,
    Balanced,
}

impl Dominance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dominance::Wwv => "WWV",
            Dominance::Wwvh => "WWVH",
            Dominance::Balanced => "BALANCED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub dominant: Dominance,
    pub confidence: f64,
    pub confidence_tag: &'static str,
    pub score_wwv: f64,
    pub score_wwvh: f64,
    pub votes: Vec<MethodVote>,
}

/// Method measurements offered to the combiner. Any subset may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodInputs {
    /// BCD amplitudes (wwv, wwvh).
    pub bcd_amplitudes: Option<(f64, f64)>,
    /// Minute-tone powers in dB (wwv, wwvh).
    pub tone_powers_db: Option<(f64, f64)>,
    /// Tick SNRs in dB (wwv, wwvh).
    pub tick_snrs_db: Option<(f64, f64)>,
    /// 440 Hz detections: (wwv_detected, wwv_db, wwvh_detected, wwvh_db).
    pub tone_440: Option<(bool, f64, bool, f64)>,
}

pub struct VotingCombiner {
    config: VotingConfig,
}

impl VotingCombiner {
    pub fn new(config: VotingConfig) -> Self {
        Self { config }
    }

    pub fn combine(&self, minute_number: u32, inputs: &MethodInputs) -> VoteOutcome {
        let weights = minute_weights(minute_number);
        let mut votes = Vec::new();

        if let Some((wwv, wwvh)) = inputs.bcd_amplitudes {
            votes.push(self.amplitude_vote(VoteKind::Bcd, weights.bcd, wwv, wwvh));
        }
        if let Some((wwv_db, wwvh_db)) = inputs.tone_powers_db {
            votes.push(self.db_vote(VoteKind::TonePower, weights.tone, wwv_db - wwvh_db));
        }
        if let Some((wwv_db, wwvh_db)) = inputs.tick_snrs_db {
            votes.push(self.db_vote(VoteKind::TickSnr, weights.tick, wwv_db - wwvh_db));
        }
        if let Some((wwv_det, wwv_db, wwvh_det, wwvh_db)) = inputs.tone_440 {
            votes.push(self.tone_440_vote(weights.tone_440, wwv_det, wwv_db, wwvh_det, wwvh_db));
        }

        self.decide(votes)
    }

    fn amplitude_vote(&self, kind: VoteKind, weight: f64, wwv: f64, wwvh: f64) -> MethodVote {
        // dB-equivalent margin for linear amplitudes
        self.margin_to_vote(kind, weight, crate::dsp::amp_db(wwv, wwvh))
    }

    fn db_vote(&self, kind: VoteKind, weight: f64, margin_db: f64) -> MethodVote {
        self.margin_to_vote(kind, weight, margin_db)
    }

    fn tone_440_vote(
        &self,
        weight: f64,
        wwv_det: bool,
        wwv_db: f64,
        wwvh_det: bool,
        wwvh_db: f64,
    ) -> MethodVote {
        let (station, margin_db) = match (wwv_det, wwvh_det) {
            (true, false) => (Some(VoteStation::Wwv), (wwv_db - wwvh_db).abs().max(6.0)),
            (false, true) => (Some(VoteStation::Wwvh), (wwvh_db - wwv_db).abs().max(6.0)),
            // The schedule makes simultaneous 440 Hz impossible; seeing
            // both (or neither) is a balanced vote.
            _ => (None, 0.0),
        };
        MethodVote {
            kind: VoteKind::Tone440,
            station,
            weight,
            margin_db,
        }
    }

    fn margin_to_vote(&self, kind: VoteKind, weight: f64, margin_db: f64) -> MethodVote {
        let station = if margin_db > self.config.min_margin_db {
            Some(VoteStation::Wwv)
        } else if margin_db < -self.config.min_margin_db {
            Some(VoteStation::Wwvh)
        } else {
            None
        };
        MethodVote {
            kind,
            station,
            weight,
            margin_db,
        }
    }

    fn decide(&self, votes: Vec<MethodVote>) -> VoteOutcome {
        let total: f64 = votes.iter().map(|v| v.weight).sum();
        if total <= 0.0 {
            return VoteOutcome {
                dominant: Dominance::Balanced,
                confidence: 0.0,
                confidence_tag: "low",
                score_wwv: 0.0,
                score_wwvh: 0.0,
                votes,
            };
        }

        let sum_for = |st: VoteStation| -> f64 {
            votes
                .iter()
                .filter(|v| v.station == Some(st))
                .map(|v| v.weight)
                .sum()
        };
        let score_wwv = sum_for(VoteStation::Wwv) / total;
        let score_wwvh = sum_for(VoteStation::Wwvh) / total;

        let dominant = if (score_wwv - score_wwvh).abs() < self.config.balance_threshold {
            Dominance::Balanced
        } else if score_wwv > score_wwvh {
            Dominance::Wwv
        } else {
            Dominance::Wwvh
        };

        let confidence = score_wwv.max(score_wwvh);
        let confidence_tag = if confidence >= self.config.high_confidence {
            "high"
        } else if confidence >= self.config.medium_confidence {
            "medium"
        } else {
            "low"
        };

        VoteOutcome {
            dominant,
            confidence,
            confidence_tag,
            score_wwv,
            score_wwvh,
            votes,
        }
    }
}

struct MinuteWeights {
    bcd: f64,
    tone: f64,
    tick: f64,
    tone_440: f64,
}

/// Schedule-aware weight table.
fn minute_weights(minute: u32) -> MinuteWeights {
    if minute == WWVH_440_MINUTE || minute == WWV_440_MINUTE {
        // 440 Hz station-ID minutes
        MinuteWeights {
            tone_440: 10.0,
            tick: 5.0,
            bcd: 2.0,
            tone: 0.0,
        }
    } else if matches!(minute, 0 | 8 | 9 | 10 | 29 | 30) {
        // BCD-rich minutes
        MinuteWeights {
            bcd: 10.0,
            tick: 5.0,
            tone: 2.0,
            tone_440: 0.0,
        }
    } else {
        MinuteWeights {
            tone: 10.0,
            tick: 5.0,
            bcd: 2.0,
            tone_440: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combiner() -> VotingCombiner {
        VotingCombiner::new(VotingConfig::default())
    }

    #[test]
    fn test_no_inputs_is_balanced_low() {
        let out = combiner().combine(15, &MethodInputs::default());
        assert_eq!(out.dominant, Dominance::Balanced);
        assert_eq!(out.confidence_tag, "low");
    }

    #[test]
    fn test_bcd_dual_peak_drives_decision() {
        // Strong BCD, no other methods (mid-hour minute)
        let inputs = MethodInputs {
            bcd_amplitudes: Some((1.0, 0.5)),
            ..Default::default()
        };
        let out = combiner().combine(15, &inputs);
        assert_eq!(out.dominant, Dominance::Wwv);
        assert_eq!(out.confidence_tag, "high");
    }

    #[test]
    fn test_440_minute_1_wwvh() {
        // Only WWVH's 440 Hz present during minute 1; ticks balanced
        let inputs = MethodInputs {
            tone_440: Some((false, -60.0, true, -20.0)),
            tick_snrs_db: Some((0.5, 0.7)),
            ..Default::default()
        };
        let out = combiner().combine(1, &inputs);
        assert_eq!(out.dominant, Dominance::Wwvh);
        assert!(
            out.confidence >= 0.4,
            "confidence {} should be at least medium",
            out.confidence
        );
    }

    #[test]
    fn test_balanced_tone_powers() {
        let inputs = MethodInputs {
            tone_powers_db: Some((-20.0, -19.0)), // 1 dB apart: below margin
            ..Default::default()
        };
        let out = combiner().combine(15, &inputs);
        assert_eq!(out.dominant, Dominance::Balanced);
    }

    #[test]
    fn test_conflicting_methods_weighted() {
        // Minute 15: tone is primary (10), tick secondary (5), bcd tertiary (2).
        // Tone says WWV, tick and bcd say WWVH.
        let inputs = MethodInputs {
            tone_powers_db: Some((-10.0, -30.0)),
            tick_snrs_db: Some((3.0, 12.0)),
            bcd_amplitudes: Some((0.2, 1.0)),
            ..Default::default()
        };
        let out = combiner().combine(15, &inputs);
        // 10 vs 7 of 17: |0.588 - 0.412| = 0.176 > 0.15
        assert_eq!(out.dominant, Dominance::Wwv);
        assert_eq!(out.confidence_tag, "medium");
    }

    #[test]
    fn test_bcd_rich_minute_prefers_bcd() {
        let inputs = MethodInputs {
            bcd_amplitudes: Some((1.0, 0.3)),
            tone_powers_db: Some((-30.0, -10.0)), // tone disagrees
            ..Default::default()
        };
        let out = combiner().combine(8, &inputs);
        // BCD weight 10 vs tone weight 2
        assert_eq!(out.dominant, Dominance::Wwv);
    }

    #[test]
    fn test_zero_weight_votes_do_not_count() {
        // Minute 15 gives tone_440 weight 0; a detection there must not
        // influence the outcome.
        let inputs = MethodInputs {
            tone_440: Some((true, -20.0, false, -60.0)),
            ..Default::default()
        };
        let out = combiner().combine(15, &inputs);
        assert_eq!(out.dominant, Dominance::Balanced);
        assert_eq!(out.confidence_tag, "low");
    }
}
