//! Human-readable dumps of registry and driver state, for interpolating
//! into test failure messages. Nothing here touches a file or a socket; both
//! entry points return an owned `String`.

use crate::config::Verbosity;
use crate::registry::Registry;
use std::io::Write as _;
use tabwriter::TabWriter;

/// Renders `registry`'s state forest as an aligned table of id, name, and
/// superstate name (or `-` for top-level states).
///
/// `Silent` yields the empty string; `Summary` yields one line naming the
/// registry and its state count; `Trace` yields the full table.
#[must_use]
pub fn registry_report(registry: &Registry, verbosity: Verbosity) -> String {
    match verbosity {
        Verbosity::Silent => String::new(),
        Verbosity::Summary => format!("{}: {} state(s)\n", registry.name(), registry.len()),
        Verbosity::Trace => {
            let mut tw = TabWriter::new(Vec::new()).padding(2);
            writeln!(tw, "id\tname\tsuperstate").ok();
            for state in registry.states() {
                let superstate = state
                    .superstate()
                    .map_or_else(|| "-".to_owned(), |s| s.name().to_owned());
                writeln!(tw, "{}\t{}\t{}", state.id(), state.name(), superstate).ok();
            }
            tw.flush().ok();
            String::from_utf8(tw.into_inner().unwrap_or_default()).unwrap_or_default()
        }
    }
}

/// A single row describing one entry in a driver's instrumentation table,
/// for rendering via [driver_report].
pub struct InstrumentationRow {
    /// The subsystem name the instance belongs to.
    pub subsystem: String,
    /// The instance id.
    pub instance: u64,
    /// The name of the instance's current state, if reported.
    pub current_state: Option<String>,
    /// How many alerts are pending on this (subsystem, instance) pair.
    pub pending_alerts: usize,
}

/// Renders a driver's instrumentation rows as an aligned table of
/// subsystem, instance, current state, and pending-alert count.
///
/// `Silent` yields the empty string; `Summary` yields one line naming the
/// driver and its row count; `Trace` yields the full table.
#[must_use]
pub fn driver_report(address: &str, rows: &[InstrumentationRow], verbosity: Verbosity) -> String {
    match verbosity {
        Verbosity::Silent => String::new(),
        Verbosity::Summary => format!("{address}: {} instrumented instance(s)\n", rows.len()),
        Verbosity::Trace => {
            let mut tw = TabWriter::new(Vec::new()).padding(2);
            writeln!(tw, "subsystem\tinstance\tstate\tpending").ok();
            for row in rows {
                writeln!(
                    tw,
                    "{}\t{}\t{}\t{}",
                    row.subsystem,
                    row.instance,
                    row.current_state.as_deref().unwrap_or("-"),
                    row.pending_alerts,
                )
                .ok();
            }
            tw.flush().ok();
            String::from_utf8(tw.into_inner().unwrap_or_default()).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_is_empty() {
        let r = Registry::new("Pipe::reader");
        r.create_state("create", None).unwrap();
        assert_eq!("", registry_report(&r, Verbosity::Silent));
        assert_eq!("", driver_report("localhost", &[], Verbosity::Silent));
    }

    #[test]
    fn summary_is_one_line() {
        let r = Registry::new("Pipe::reader");
        r.create_state("create", None).unwrap();
        let summary = registry_report(&r, Verbosity::Summary);
        assert_eq!(1, summary.lines().count());
        assert!(summary.contains("Pipe::reader"));
    }

    #[test]
    fn trace_includes_state_names() {
        let r = Registry::new("Pipe::reader");
        r.create_state("create", None).unwrap();
        let open = r.create_state("accept::open", None).unwrap();
        let report = registry_report(&r, Verbosity::Trace);
        assert!(report.contains("create"));
        assert!(report.contains("accept::open"));
        assert!(report.contains(&open.to_string()));
    }

    #[test]
    fn driver_trace_includes_rows() {
        let rows = vec![InstrumentationRow {
            subsystem: "Pipe::reader".to_owned(),
            instance: 7,
            current_state: Some("accept::open".to_owned()),
            pending_alerts: 2,
        }];
        let report = driver_report("localhost:1234", &rows, Verbosity::Trace);
        assert!(report.contains("accept::open"));
        assert!(report.contains('7'));
        assert!(report.contains('2'));
    }
}
