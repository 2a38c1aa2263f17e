//! Parser for the scale controller's line-oriented serial output.
//!
//! The controller prints one field per line (sometimes several), e.g.
//!
//! ```text
//! Average Weight: 1.25
//! Average Volume: 340
//! Fee: Rs. 45.50  T=B
//! ```
//!
//! A [`Reading`] is emitted as soon as weight, volume and fee are all known.

use crate::config::IngestConfig;
use crate::types::Reading;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;

/// Fee type used when the controller never printed one.
pub const UNKNOWN_FEE_TYPE: &str = "U";

static WEIGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:average\s+)?weight:\s*(-?\d+(?:\.\d+)?)").expect("static pattern")
});

static VOLUME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:average\s+)?volume:\s*(-?\d+(?:\.\d+)?)").expect("static pattern")
});

static FEE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)fee:\s*rs\.?\s*(-?\d+(?:\.\d+)?)").expect("static pattern")
});

static FEE_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bt\s*=?\s*([a-z])\b").expect("static pattern"));

#[derive(Debug, Default, Clone, PartialEq)]
struct Pending {
    weight: Option<f64>,
    volume: Option<f64>,
    fee: Option<f64>,
    fee_type: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScaleLineParser {
    pending: Pending,
}

impl ScaleLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one line of controller output.
    ///
    /// Returns the completed reading when this line supplied the last missing
    /// field; the parser then starts over.
    pub fn feed_line(&mut self, line: &str) -> Option<Reading> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(weight) = capture_number(&WEIGHT, line) {
            self.pending.weight = Some(weight);
        }
        if let Some(volume) = capture_number(&VOLUME, line) {
            self.pending.volume = Some(volume);
        }
        if let Some(fee) = capture_number(&FEE, line) {
            self.pending.fee = Some(fee);
        }
        if let Some(caps) = FEE_TYPE.captures(line) {
            self.pending.fee_type = Some(caps[1].to_uppercase());
        }

        match &self.pending {
            Pending {
                weight: Some(weight),
                volume: Some(volume),
                fee: Some(fee),
                fee_type,
            } => {
                let reading = Reading::new(
                    *weight,
                    *volume,
                    fee_type.as_deref().unwrap_or(UNKNOWN_FEE_TYPE),
                    *fee,
                );
                self.reset();
                Some(reading)
            }
            _ => None,
        }
    }

    /// Drop any partially collected fields.
    pub fn reset(&mut self) {
        self.pending = Pending::default();
    }

    pub fn has_partial(&self) -> bool {
        self.pending != Pending::default()
    }
}

/// Drops readings that repeat the previous one.
///
/// The controller keeps printing the same averages while a parcel sits on the
/// scale. A reading passes when it moved past any threshold (or changed fee
/// type) relative to the previous reading, or when the last admitted reading
/// is at least `min_interval` old. Dropped readings are not kept.
#[derive(Debug)]
pub struct ReadingFilter {
    config: IngestConfig,
    previous: Option<Reading>,
    last_admitted: Option<(String, Instant)>,
}

impl ReadingFilter {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            previous: None,
            last_admitted: None,
        }
    }

    pub fn admit(&mut self, reading: &Reading) -> bool {
        self.admit_at(reading, Instant::now())
    }

    pub fn admit_at(&mut self, reading: &Reading, now: Instant) -> bool {
        let previous = self.previous.replace(reading.clone());
        let throttled = self.last_admitted.as_ref().is_some_and(|(_, at)| {
            now.saturating_duration_since(*at) < self.config.min_interval()
        });

        if throttled && !self.is_significant_change(previous.as_ref(), reading) {
            return false;
        }

        let key = reading_key(reading);
        if throttled
            && self
                .last_admitted
                .as_ref()
                .is_some_and(|(last_key, _)| *last_key == key)
        {
            return false;
        }

        self.last_admitted = Some((key, now));
        true
    }

    fn is_significant_change(&self, previous: Option<&Reading>, current: &Reading) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        (previous.weight - current.weight).abs() >= self.config.weight_threshold
            || (previous.volume - current.volume).abs() >= self.config.volume_threshold
            || (previous.fee - current.fee).abs() >= self.config.fee_threshold
            || previous.fee_type != current.fee_type
    }
}

fn reading_key(reading: &Reading) -> String {
    format!(
        "{:.2}|{:.2}|{:.2}|{}",
        reading.weight, reading.volume, reading.fee, reading.fee_type
    )
}

fn capture_number(pattern: &Regex, line: &str) -> Option<f64> {
    pattern
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .filter(|value| value.is_finite())
}
