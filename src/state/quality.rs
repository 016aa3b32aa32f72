//! Connection quality scoring.
//!
//! Each connection starts at a score of 100 and loses points for weak
//! signal, slow responses and a rising error rate. The score is clamped to
//! 0..100 and mapped onto coarse health bands; worsening any input never
//! raises the score.

use serde::{Deserialize, Serialize};

/// Raw quality measurements of one connection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    /// Received signal strength, dBm. None for wired links
    #[serde(default)]
    pub signal_strength_dbm: Option<i32>,
    /// Rolling average request/response latency
    pub response_time_ms: u64,
    /// Errors per hundred exchanges
    pub error_rate_percent: f32,
    /// Observed throughput, bits per second
    pub throughput_bps: u64,
    /// How long the link has been up
    pub uptime_ms: u64,
}

impl ConnectionQuality {
    /// Derives the 0..100 quality score.
    pub fn score(&self) -> u8 {
        let mut score: i32 = 100;
        if let Some(rssi) = self.signal_strength_dbm {
            if rssi < -90 {
                score -= 30;
            } else if rssi < -80 {
                score -= 20;
            } else if rssi < -70 {
                score -= 10;
            }
        }
        if self.response_time_ms > 5000 {
            score -= 30;
        } else if self.response_time_ms > 2000 {
            score -= 20;
        } else if self.response_time_ms > 1000 {
            score -= 10;
        }
        if self.error_rate_percent > 20.0 {
            score -= 40;
        } else if self.error_rate_percent > 10.0 {
            score -= 25;
        } else if self.error_rate_percent > 5.0 {
            score -= 15;
        }
        score.clamp(0, 100) as u8
    }

    /// Health band the score falls into
    pub fn health(&self) -> HealthBand {
        HealthBand::from_score(self.score())
    }

    /// A connection is healthy from a score of 60 upwards
    pub fn is_healthy(&self) -> bool {
        self.score() >= 60
    }
}

/// Coarse health classification of a score
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display,
    Serialize, Deserialize,
)]
pub enum HealthBand {
    /// Score below 40
    Poor,
    /// Score 40..59
    Fair,
    /// Score 60..79
    Good,
    /// Score 80 and above
    Excellent,
}

impl HealthBand {
    /// Maps a 0..100 score onto its band
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Excellent,
            60..=79 => Self::Good,
            40..=59 => Self::Fair,
            _ => Self::Poor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConnectionQuality {
        ConnectionQuality {
            signal_strength_dbm: Some(-50),
            response_time_ms: 100,
            error_rate_percent: 0.0,
            throughput_bps: 1_000_000,
            uptime_ms: 60_000,
        }
    }

    #[test]
    fn perfect_connection_scores_100() {
        assert_eq!(base().score(), 100);
        assert_eq!(base().health(), HealthBand::Excellent);
        assert!(base().is_healthy());
    }

    #[test]
    fn wired_links_skip_the_rssi_penalty() {
        let mut q = base();
        q.signal_strength_dbm = None;
        assert_eq!(q.score(), 100);
    }

    #[test]
    fn penalties_stack() {
        let q = ConnectionQuality {
            signal_strength_dbm: Some(-85),
            response_time_ms: 2500,
            error_rate_percent: 7.0,
            throughput_bps: 9600,
            uptime_ms: 1000,
        };
        // 100 - 20 (rssi) - 20 (latency) - 15 (errors)
        assert_eq!(q.score(), 45);
        assert_eq!(q.health(), HealthBand::Fair);
        assert!(!q.is_healthy());
    }

    #[test]
    fn score_clamps_at_zero() {
        let q = ConnectionQuality {
            signal_strength_dbm: Some(-95),
            response_time_ms: 9000,
            error_rate_percent: 50.0,
            throughput_bps: 0,
            uptime_ms: 0,
        };
        assert_eq!(q.score(), 0);
        assert_eq!(q.health(), HealthBand::Poor);
    }

    #[test]
    fn worsening_an_input_never_raises_the_score() {
        // Walk each input through its bands and require monotonicity
        let mut last = u8::MAX;
        for rssi in [-50, -75, -85, -95] {
            let mut q = base();
            q.signal_strength_dbm = Some(rssi);
            assert!(q.score() <= last);
            last = q.score();
        }
        last = u8::MAX;
        for rt in [500, 1500, 3000, 6000] {
            let mut q = base();
            q.response_time_ms = rt;
            assert!(q.score() <= last);
            last = q.score();
        }
        last = u8::MAX;
        for er in [0.0, 6.0, 11.0, 21.0] {
            let mut q = base();
            q.error_rate_percent = er;
            assert!(q.score() <= last);
            last = q.score();
        }
    }

    #[test]
    fn band_boundaries() {
        assert_eq!(HealthBand::from_score(80), HealthBand::Excellent);
        assert_eq!(HealthBand::from_score(79), HealthBand::Good);
        assert_eq!(HealthBand::from_score(60), HealthBand::Good);
        assert_eq!(HealthBand::from_score(59), HealthBand::Fair);
        assert_eq!(HealthBand::from_score(40), HealthBand::Fair);
        assert_eq!(HealthBand::from_score(39), HealthBand::Poor);
    }
}
