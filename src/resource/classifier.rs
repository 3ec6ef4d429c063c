//! Threshold classification
//!
//! Comparison runs from the highest threshold down and applies no hysteresis:
//! one sample across a boundary flips the status. Flapping is damped by the
//! tick interval and strategy cooldowns instead.

use super::{Snapshot, Status};
use crate::config::ThresholdSet;

/// Map a usage ratio onto a status.
pub fn classify_ratio(ratio: f64, thresholds: &ThresholdSet) -> Status {
    if ratio >= thresholds.exhausted {
        Status::Exhausted
    } else if ratio >= thresholds.critical {
        Status::Critical
    } else if ratio >= thresholds.warning {
        Status::Warning
    } else {
        Status::Normal
    }
}

/// Classify a snapshot. Unknown snapshots keep `previous`.
pub fn classify(snapshot: &Snapshot, thresholds: &ThresholdSet, previous: Status) -> Status {
    if snapshot.is_unknown() {
        return previous;
    }
    classify_ratio(snapshot.usage_ratio, thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResourceError;
    use crate::resource::{Domain, ResourceStats};

    fn thresholds() -> ThresholdSet {
        ThresholdSet::new(0.75, 0.85, 0.95)
    }

    #[test]
    fn test_classify_boundaries_are_inclusive() {
        let t = thresholds();
        assert_eq!(classify_ratio(0.0, &t), Status::Normal);
        assert_eq!(classify_ratio(0.7499, &t), Status::Normal);
        assert_eq!(classify_ratio(0.75, &t), Status::Warning);
        assert_eq!(classify_ratio(0.85, &t), Status::Critical);
        assert_eq!(classify_ratio(0.95, &t), Status::Exhausted);
        assert_eq!(classify_ratio(1.0, &t), Status::Exhausted);
    }

    #[test]
    fn test_ratio_of_ninety_percent_is_critical() {
        let snap = Snapshot::measured(Domain::Memory, ResourceStats::new(90.0, 100.0, "bytes"));
        assert_eq!(classify(&snap, &thresholds(), Status::Normal), Status::Critical);
    }

    #[test]
    fn test_unknown_snapshot_keeps_previous_status() {
        let snap = Snapshot::unknown(
            Domain::Cpu,
            &ResourceError::Unavailable("counter missing".into()),
        );
        for previous in [Status::Normal, Status::Warning, Status::Exhausted] {
            assert_eq!(classify(&snap, &thresholds(), previous), previous);
        }
    }

    #[test]
    fn test_no_hysteresis() {
        let t = thresholds();
        assert_eq!(classify_ratio(0.851, &t), Status::Critical);
        assert_eq!(classify_ratio(0.849, &t), Status::Warning);
        assert_eq!(classify_ratio(0.851, &t), Status::Critical);
    }
}
