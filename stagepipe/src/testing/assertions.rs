//! Assertions on finished runs.

use crate::pipeline::{RunReport, TerminationCause};

/// Asserts that every started instance was asked to stop and acknowledged.
///
/// # Panics
///
/// Panics if a stop request was skipped or left unacknowledged.
pub fn assert_fully_stopped(report: &RunReport) {
    assert_eq!(
        report.stop_requests, report.instances,
        "expected a stop request per instance: {report:?}"
    );
    assert_eq!(
        report.acknowledgments, report.instances,
        "expected an acknowledgment per instance: {report:?}"
    );
}

/// Asserts that the run ended because a producer quit.
///
/// # Panics
///
/// Panics on any other termination cause.
pub fn assert_quit_by(report: &RunReport, stage: &str) {
    match &report.cause {
        TerminationCause::Quit(notice) => assert_eq!(notice.stage, stage, "quit by wrong stage"),
        other => panic!("expected quit by '{stage}', run ended with: {other}"),
    }
}

/// Asserts that the run ended on a fatal supervision error for `unit`.
///
/// # Panics
///
/// Panics on any other termination cause.
pub fn assert_fatal_for(report: &RunReport, unit: &str) {
    match &report.cause {
        TerminationCause::Fatal(err) => assert_eq!(err.unit, unit, "fatal for wrong unit"),
        other => panic!("expected fatal error for '{unit}', run ended with: {other}"),
    }
}
