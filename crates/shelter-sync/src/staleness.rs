//! Decides whether the local snapshot must be refreshed from upstream.

use chrono::NaiveDateTime;
use serde::Serialize;
use shelter_core::{latest_import, EnrichedRecord, SourceRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StaleReason {
    ColdStart,
    NewerUpstream {
        local: NaiveDateTime,
        remote: NaiveDateTime,
    },
    IncompleteSnapshot {
        local_rows: usize,
        remote_rows: usize,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StalenessDetector;

impl StalenessDetector {
    /// Compares import timestamps only. Without a parseable timestamp on both
    /// sides there is no signal, and no refresh.
    pub fn assess(
        &self,
        local: Option<&[EnrichedRecord]>,
        remote_sample: &[SourceRecord],
    ) -> Option<StaleReason> {
        let Some(local) = local else {
            return Some(StaleReason::ColdStart);
        };
        let local_latest = latest_import(local.iter().map(|r| &r.source))?;
        let remote_latest = latest_import(remote_sample)?;
        (remote_latest > local_latest).then_some(StaleReason::NewerUpstream {
            local: local_latest,
            remote: remote_latest,
        })
    }

    pub fn needs_refresh(
        &self,
        local: Option<&[EnrichedRecord]>,
        remote_sample: &[SourceRecord],
    ) -> bool {
        self.assess(local, remote_sample).is_some()
    }

    /// A snapshot holding fewer rows than upstream publishes is stale.
    pub fn check_completeness(&self, local_rows: usize, remote_rows: usize) -> Option<StaleReason> {
        (local_rows < remote_rows).then_some(StaleReason::IncompleteSnapshot {
            local_rows,
            remote_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(date: Option<&str>) -> SourceRecord {
        SourceRecord {
            shelter_code: Some("A".into()),
            import_date: date.map(ToString::to_string),
            ..SourceRecord::default()
        }
    }

    fn local(dates: &[&str]) -> Vec<EnrichedRecord> {
        dates
            .iter()
            .map(|&d| EnrichedRecord::from_source(source(Some(d))))
            .collect()
    }

    #[test]
    fn cold_start_always_refreshes() {
        let detector = StalenessDetector;
        assert_eq!(detector.assess(None, &[]), Some(StaleReason::ColdStart));
        assert!(detector.needs_refresh(None, &[source(None)]));
    }

    #[test]
    fn newer_remote_import_refreshes() {
        let detector = StalenessDetector;
        let snapshot = local(&["2024-01-01 00:00:00", "2024-02-01 00:00:00"]);
        let remote = [source(Some("2024-03-01 10:00:00.000000"))];
        assert!(matches!(
            detector.assess(Some(snapshot.as_slice()), &remote),
            Some(StaleReason::NewerUpstream { .. })
        ));
    }

    #[test]
    fn equal_or_older_remote_is_fresh() {
        let detector = StalenessDetector;
        let snapshot = local(&["2024-03-01 10:00:00"]);
        assert!(!detector.needs_refresh(Some(snapshot.as_slice()), &[source(Some("2024-03-01 10:00:00"))]));
        assert!(!detector.needs_refresh(Some(snapshot.as_slice()), &[source(Some("2023-12-31"))]));
    }

    #[test]
    fn unparseable_timestamps_are_no_signal() {
        let detector = StalenessDetector;
        let snapshot = local(&["2024-03-01 10:00:00"]);
        assert!(!detector.needs_refresh(Some(snapshot.as_slice()), &[source(Some("yesterday"))]));
        assert!(!detector.needs_refresh(Some(snapshot.as_slice()), &[source(None)]));
        assert!(!detector.needs_refresh(Some(snapshot.as_slice()), &[]));

        let garbled = local(&["n/a"]);
        assert!(!detector.needs_refresh(Some(garbled.as_slice()), &[source(Some("2030-01-01"))]));
    }

    #[test]
    fn short_snapshot_is_incomplete() {
        let detector = StalenessDetector;
        assert_eq!(
            detector.check_completeness(3, 5),
            Some(StaleReason::IncompleteSnapshot {
                local_rows: 3,
                remote_rows: 5
            })
        );
        assert_eq!(detector.check_completeness(5, 5), None);
        assert_eq!(detector.check_completeness(6, 5), None);
    }
}
