//! JSON report output

use std::io::Write;
use std::path::Path;

use chrono::Utc;
use trace_types::{count_anomalies, TraceReport};
use ulid::Ulid;

use crate::bands::{band_boundaries, worker_lanes, LogicalBands};
use crate::pipeline::ProcessedTrace;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report to {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
}

pub fn build(processed: ProcessedTrace) -> TraceReport {
    let ProcessedTrace {
        main_reactor,
        tables,
        labels,
        causal_edges,
        ordering_edges,
        anomalies,
    } = processed;

    let bands = LogicalBands::from_tables(&tables).to_bands();
    let band_boundaries = band_boundaries(&tables.executions);
    let workers = worker_lanes(&tables.executions);
    let anomaly_counts = count_anomalies(&anomalies);

    TraceReport {
        run_id: Ulid::new().to_string(),
        generated_at: Utc::now(),
        main_reactor,
        labels: labels.names().to_vec(),
        reactions: tables.reactions,
        actions: tables.actions,
        executions: tables.executions,
        causal_edges,
        ordering_edges,
        bands,
        band_boundaries,
        workers,
        anomalies,
        anomaly_counts,
    }
}

pub fn to_json(report: &TraceReport, pretty: bool) -> Result<String, ReportError> {
    let json = if pretty {
        serde_json::to_string_pretty(report)?
    } else {
        serde_json::to_string(report)?
    };
    Ok(json)
}

/// Writes to `output`, or stdout when `None`.
pub fn write(report: &TraceReport, output: Option<&Path>, pretty: bool) -> Result<(), ReportError> {
    let json = to_json(report, pretty)?;
    match output {
        Some(path) => {
            std::fs::write(path, json.as_bytes()).map_err(|error| ReportError::Io {
                path: path.display().to_string(),
                error,
            })?;
            tracing::info!(path = %path.display(), bytes = json.len(), "Wrote report");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}")
                .and_then(|_| stdout.flush())
                .map_err(|error| ReportError::Io {
                    path: "<stdout>".to_string(),
                    error,
                })?;
        }
    }
    Ok(())
}

/// One-line run summary through the log.
pub fn log_summary(report: &TraceReport) {
    tracing::info!(
        run_id = %report.run_id,
        main_reactor = %report.main_reactor,
        reactions = report.reactions.len(),
        actions = report.actions.len(),
        executions = report.executions.len(),
        causal_edges = report.causal_edges.len(),
        ordering_edges = report.ordering_edges.len(),
        skipped = report.skipped_rows(),
        degenerate = report.degenerate_rows(),
        "Trace processed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_stream::EventStream;
    use crate::pipeline::{process, ProcessOptions};
    use crate::schema::SchemaIndex;
    use crate::test_support::{finish, start, triggered, TWO_REACTOR_SCHEMA};

    fn report() -> TraceReport {
        let schema = SchemaIndex::from_yaml_str(TWO_REACTOR_SCHEMA).unwrap();
        let stream = EventStream::from_records(vec![
            start("A", "r1", 100).with_worker(1),
            finish("A", "r1", 150),
            triggered("B", "r2", 150, 0),
            finish("B", "r2", 160),
        ])
        .unwrap();
        build(process(&schema, stream, &ProcessOptions::default()).unwrap())
    }

    #[test]
    fn test_build_summarizes_run() {
        let report = report();
        assert_eq!(report.labels, vec!["A.r1".to_string(), "B.r2".to_string()]);
        assert_eq!(report.workers, vec![1]);
        assert_eq!(report.skipped_rows(), 1);
        assert_eq!(report.degenerate_rows(), 0);
        assert!(Ulid::from_string(&report.run_id).is_ok());
    }

    #[test]
    fn test_json_contains_tables_and_counts() {
        let json = to_json(&report(), false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["executions"][0]["name"], "A.r1");
        assert_eq!(value["causal_edges"][0]["source"]["table"], "executions");
        assert_eq!(value["anomaly_counts"]["dangling_end"], 1);
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write(&report(), Some(path.as_path()), true).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\n  \"run_id\""));
    }
}
