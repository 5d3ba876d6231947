//! Worker to supervisor status reports.
//!
//! Messages are JSON-serialized and newline-delimited on the worker's stdout.

use std::io;
use std::io::Write;

use serde::Deserialize;
use serde::Serialize;

use crate::ids::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerReport {
    /// The worker owns the listener and is accepting.
    #[serde(rename_all = "camelCase")]
    Ready { worker_id: WorkerId, pid: u32 },
    /// Current size of the worker's connection registry.
    #[serde(rename_all = "camelCase")]
    Connections { worker_id: WorkerId, open: usize },
    /// The worker stopped accepting and is closing its connections.
    #[serde(rename_all = "camelCase")]
    Draining { worker_id: WorkerId, open: usize },
}

impl WorkerReport {
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    pub fn open_connections(&self) -> Option<usize> {
        match self {
            WorkerReport::Ready { .. } => None,
            WorkerReport::Connections { open, .. } | WorkerReport::Draining { open, .. } => {
                Some(*open)
            }
        }
    }
}

/// Destination for a worker's status reports.
pub trait ReportSink: Send {
    fn send(&mut self, report: &WorkerReport) -> io::Result<()>;
}

/// Writes one report per line and flushes, so the reader sees it immediately.
pub struct LineReporter<W> {
    writer: W,
}

impl<W: Write + Send> LineReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl LineReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ReportSink for LineReporter<W> {
    fn send(&mut self, report: &WorkerReport) -> io::Result<()> {
        self.writer.write_all(report.to_line().as_bytes())?;
        self.writer.flush()
    }
}

/// Discards reports; used when a worker runs without a supervisor.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl ReportSink for NoopReporter {
    fn send(&mut self, _report: &WorkerReport) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_are_single_json_lines() {
        let report = WorkerReport::Connections {
            worker_id: WorkerId::new(3),
            open: 12,
        };
        let line = report.to_line();
        assert_eq!(line, "{\"type\":\"connections\",\"workerId\":3,\"open\":12}\n");
        assert_eq!(WorkerReport::from_line(&line).unwrap(), report);
        assert_eq!(report.open_connections(), Some(12));
    }

    #[test]
    fn line_reporter_writes_each_report() {
        let mut reporter = LineReporter::new(Vec::new());
        reporter
            .send(&WorkerReport::Ready {
                worker_id: WorkerId::new(1),
                pid: 77,
            })
            .unwrap();
        reporter
            .send(&WorkerReport::Draining {
                worker_id: WorkerId::new(1),
                open: 0,
            })
            .unwrap();
        let written = String::from_utf8(reporter.writer).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(matches!(
            WorkerReport::from_line(lines[0]).unwrap(),
            WorkerReport::Ready { pid: 77, .. }
        ));
    }

    #[test]
    fn garbage_lines_fail_to_parse() {
        assert!(WorkerReport::from_line("panicked at src/main.rs").is_err());
    }
}
