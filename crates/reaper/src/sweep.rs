//! The enumeration and cleanup loop.
//!
//! A sweep lists containers once, then handles each one independently:
//! inspect, compute its age, and force-remove it if it is older than the
//! threshold. Failures for one container are logged and skipped; only a
//! failed list call aborts the sweep.

use std::fmt::Display;
use std::io::Write;

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{Report, Result};
use thiserror::Error;

use crate::audit::AuditLog;
use crate::runtime::ContainerRuntime;

/// Why a single container was skipped.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("Failed to inspect container {id}: {err:#}")]
    Inspect { id: String, err: Report },
    #[error("Failed to parse container created time {raw:?} for container {id}: {source}")]
    Timestamp {
        id: String,
        raw: String,
        source: chrono::ParseError,
    },
    #[error("Failed to remove container {id}: {err:#}")]
    Remove { id: String, err: Report },
    #[error("Removed container {id} but failed to record it: {source}")]
    Audit { id: String, source: std::io::Error },
}

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Containers returned by the list call
    pub examined: usize,
    /// Containers removed and recorded
    pub removed: usize,
    /// Containers skipped because of an [`ItemError`]
    pub skipped: usize,
}

/// Parse a runtime creation timestamp (RFC 3339, any sub-second precision).
pub fn parse_created(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

/// Elapsed time between `created` and `now` in fractional minutes.
///
/// Negative when `created` is in the future (clock skew).
pub fn age_minutes(now: &DateTime<Utc>, created: &DateTime<Utc>) -> f64 {
    let delta = *now - *created;
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 60e9,
        None => delta.num_milliseconds() as f64 / 60e3,
    }
}

/// Remove every listed container older than `threshold_minutes`.
///
/// `clock` is read once, right after listing; that instant is used both for
/// age computation and for the audit timestamps.
pub fn sweep<R, W, Tz>(
    runtime: &R,
    audit: &mut AuditLog<W>,
    threshold_minutes: i64,
    clock: impl FnOnce() -> DateTime<Tz>,
) -> Result<SweepSummary>
where
    R: ContainerRuntime,
    W: Write,
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let containers = runtime.list()?;
    tracing::debug!("Found {} container(s)", containers.len());

    let now = &clock();
    let now_utc = now.with_timezone(&Utc);
    let threshold = threshold_minutes as f64;
    let mut summary = SweepSummary {
        examined: containers.len(),
        ..Default::default()
    };

    for container in containers {
        match reap_one(runtime, audit, &container.id, threshold, now, &now_utc) {
            Ok(true) => summary.removed += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("{e}");
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}

/// Returns whether the container was removed.
fn reap_one<R, W, Tz>(
    runtime: &R,
    audit: &mut AuditLog<W>,
    id: &str,
    threshold: f64,
    now: &DateTime<Tz>,
    now_utc: &DateTime<Utc>,
) -> Result<bool, ItemError>
where
    R: ContainerRuntime,
    W: Write,
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let details = runtime.inspect(id).map_err(|err| ItemError::Inspect {
        id: id.to_owned(),
        err,
    })?;
    let created = parse_created(&details.created).map_err(|source| ItemError::Timestamp {
        id: id.to_owned(),
        raw: details.created.clone(),
        source,
    })?;

    let age = age_minutes(now_utc, &created);
    if age <= threshold {
        tracing::debug!("Keeping container {id} ({age:.2} minutes old)");
        return Ok(false);
    }

    tracing::info!("Deleting container {id} that has been running for {age:.2} minutes");
    runtime.remove_forced(id).map_err(|err| ItemError::Remove {
        id: id.to_owned(),
        err,
    })?;
    audit
        .record(now, id, age)
        .map_err(|source| ItemError::Audit {
            id: id.to_owned(),
            source,
        })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io;

    use chrono::TimeDelta;
    use color_eyre::eyre::eyre;

    use super::*;
    use crate::runtime::{ContainerDetails, ContainerSummary};

    /// In-memory runtime recording every call.
    #[derive(Debug, Default)]
    struct FakeRuntime {
        order: Vec<String>,
        created: HashMap<String, String>,
        inspect_fails: Vec<String>,
        remove_fails: Vec<String>,
        list_fails: bool,
        calls: RefCell<Vec<String>>,
    }

    impl FakeRuntime {
        fn with(mut self, id: &str, created: impl Into<String>) -> Self {
            self.order.push(id.to_owned());
            self.created.insert(id.to_owned(), created.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn removed(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| c.strip_prefix("remove ").map(str::to_owned))
                .collect()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn list(&self) -> Result<Vec<ContainerSummary>> {
            self.calls.borrow_mut().push("list".into());
            if self.list_fails {
                return Err(eyre!("daemon unavailable"));
            }
            Ok(self
                .order
                .iter()
                .map(|id| ContainerSummary { id: id.clone() })
                .collect())
        }

        fn inspect(&self, id: &str) -> Result<ContainerDetails> {
            self.calls.borrow_mut().push(format!("inspect {id}"));
            if self.inspect_fails.iter().any(|f| f == id) {
                return Err(eyre!("no such container: {id}"));
            }
            let created = self
                .created
                .get(id)
                .cloned()
                .ok_or_else(|| eyre!("no such container: {id}"))?;
            Ok(ContainerDetails { created })
        }

        fn remove_forced(&self, id: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("remove {id}"));
            if self.remove_fails.iter().any(|f| f == id) {
                return Err(eyre!("removal of container {id} is already in progress"));
            }
            Ok(())
        }
    }

    /// Writer that always fails.
    #[derive(Debug)]
    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// Creation timestamp `minutes` before [`now`], with nanosecond precision
    /// as docker reports it.
    fn created_ago(minutes: i64) -> String {
        (now() - TimeDelta::minutes(minutes) + TimeDelta::nanoseconds(123_456_789))
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    }

    fn audit_lines(audit: AuditLog<Vec<u8>>) -> Vec<String> {
        String::from_utf8(audit.into_inner())
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn test_parse_created_nanoseconds() {
        let t = parse_created("2024-05-01T10:59:00.123456789Z").unwrap();
        assert_eq!(t.timestamp_subsec_nanos(), 123_456_789);
        let t = parse_created("2024-05-01T12:59:00+02:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 5, 1, 10, 59, 0).unwrap());
        assert!(parse_created("yesterday").is_err());
        assert!(parse_created("").is_err());
    }

    #[test]
    fn test_age_minutes() {
        let created = now() - TimeDelta::seconds(90);
        assert_eq!(age_minutes(&now(), &created), 1.5);
        let future = now() + TimeDelta::minutes(2);
        assert_eq!(age_minutes(&now(), &future), -2.0);
    }

    #[test]
    fn test_old_container_removed_and_recorded() {
        let runtime = FakeRuntime::default().with("old", created_ago(90));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                examined: 1,
                removed: 1,
                skipped: 0
            }
        );
        assert_eq!(runtime.removed(), vec!["old"]);
        let lines = audit_lines(audit);
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split(' ').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "2024-05-01T12:00:00Z");
        assert_eq!(fields[1], "old");
        let age: f64 = fields[2].parse().unwrap();
        assert!(age > 60.0);
        assert_eq!(fields[2], "90.00");
        assert_eq!(fields[3], "minutes");
    }

    #[test]
    fn test_young_container_untouched() {
        let runtime = FakeRuntime::default().with("young", created_ago(10));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        assert_eq!(summary.removed, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(runtime.calls(), vec!["list", "inspect young"]);
        assert!(audit_lines(audit).is_empty());
    }

    #[test]
    fn test_threshold_is_strict() {
        let exact = (now() - TimeDelta::minutes(60)).to_rfc3339();
        let runtime = FakeRuntime::default().with("exact", exact);
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        assert_eq!(summary.removed, 0);
        assert!(runtime.removed().is_empty());
    }

    #[test]
    fn test_negative_threshold_removes_everything() {
        let runtime = FakeRuntime::default()
            .with("a", created_ago(0))
            .with("b", created_ago(1));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, -1, now).unwrap();

        assert_eq!(summary.removed, 2);
        assert_eq!(runtime.removed(), vec!["a", "b"]);
        assert_eq!(audit_lines(audit).len(), 2);
    }

    #[test]
    fn test_list_failure_is_fatal_without_writes() {
        let runtime = FakeRuntime {
            list_fails: true,
            ..FakeRuntime::default()
        }
        .with("old", created_ago(90));
        let mut audit = AuditLog::new(Vec::new());

        let err = sweep(&runtime, &mut audit, 60, now).unwrap_err();

        assert!(err.to_string().contains("daemon unavailable"));
        assert_eq!(runtime.calls(), vec!["list"]);
        assert!(audit_lines(audit).is_empty());
    }

    #[test]
    fn test_inspect_failure_does_not_stop_later_containers() {
        let runtime = FakeRuntime {
            inspect_fails: vec!["broken".into()],
            ..FakeRuntime::default()
        }
        .with("broken", created_ago(90))
        .with("old", created_ago(120));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                examined: 2,
                removed: 1,
                skipped: 1
            }
        );
        assert_eq!(runtime.removed(), vec!["old"]);
        let lines = audit_lines(audit);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(" old 120.00 minutes"));
    }

    #[test]
    fn test_bad_timestamp_skipped() {
        let runtime = FakeRuntime::default()
            .with("garbled", "not-a-time")
            .with("old", created_ago(61));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(runtime.removed(), vec!["old"]);
        assert_eq!(audit_lines(audit).len(), 1);
    }

    #[test]
    fn test_remove_failure_not_recorded() {
        let runtime = FakeRuntime {
            remove_fails: vec!["stuck".into()],
            ..FakeRuntime::default()
        }
        .with("stuck", created_ago(90))
        .with("old", created_ago(90));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        assert_eq!(summary.removed, 1);
        assert_eq!(summary.skipped, 1);
        let lines = audit_lines(audit);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(" old "));
        assert!(!lines[0].contains("stuck"));
    }

    #[test]
    fn test_audit_failure_counted_as_skipped() {
        let runtime = FakeRuntime::default()
            .with("a", created_ago(90))
            .with("b", created_ago(90));
        let mut audit = AuditLog::new(BrokenWriter);

        let summary = sweep(&runtime, &mut audit, 60, now).unwrap();

        // Removal happened; only the record is missing.
        assert_eq!(runtime.removed(), vec!["a", "b"]);
        assert_eq!(summary.removed, 0);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn test_item_error_messages() {
        let err = ItemError::Inspect {
            id: "abc".into(),
            err: eyre!("boom"),
        };
        assert_eq!(err.to_string(), "Failed to inspect container abc: boom");

        let source = parse_created("nope").unwrap_err();
        let err = ItemError::Timestamp {
            id: "abc".into(),
            raw: "nope".into(),
            source,
        };
        assert!(err
            .to_string()
            .starts_with("Failed to parse container created time \"nope\" for container abc: "));
    }

    #[test]
    fn test_clock_read_after_listing() {
        let runtime = FakeRuntime::default().with("old", created_ago(90));
        let mut audit = AuditLog::new(Vec::new());

        let summary = sweep(&runtime, &mut audit, 60, || {
            assert_eq!(runtime.calls(), vec!["list"]);
            now()
        })
        .unwrap();
        assert_eq!(summary.removed, 1);
    }

    #[test]
    fn test_clock_not_read_when_listing_fails() {
        let runtime = FakeRuntime {
            list_fails: true,
            ..FakeRuntime::default()
        };
        let mut audit = AuditLog::new(Vec::new());

        let clock = || -> DateTime<Utc> { panic!("clock read after failed list") };
        assert!(sweep(&runtime, &mut audit, 60, clock).is_err());
    }
}
