//! Unit tests for the audit sinks.
//!
//! Validates JSONL writing, automatic directory creation, file naming by
//! date, concurrent write safety, and the in-memory log used as the broker's
//! request history.
//!
//! # Scenarios covered
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Audit directory missing | `JsonlAuditWriter::new` creates it |
//! | Broker denial logged | `event_type: broker_denied` with capability and reason |
//! | Entries on the same day | Appended to one file |
//! | Concurrent writers | Every line is valid JSON |
//! | Memory log queries | Filter by event type and by process |

use std::fs;
use std::sync::Arc;

use privsep_bus::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter, MemoryAuditLog};
use privsep_bus::models::ProcessId;

fn denial(id: u64) -> AuditEntry {
    AuditEntry::new(AuditEventType::BrokerDenied)
        .with_process(ProcessId(id))
        .with_role("renderer")
        .with_operation("file_read")
        .with_capability("file_read")
        .with_reason("permission denied")
        .with_sequence(7)
}

/// Contents of the one audit file expected in `dir`.
fn single_audit_file(dir: &std::path::Path) -> String {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .expect("list audit dir")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    assert_eq!(paths.len(), 1, "audit files: {paths:?}");
    fs::read_to_string(paths.remove(0)).expect("read audit file")
}

// ── JSONL writer ──────────────────────────────────────────────────────────────

/// The constructor creates a missing, nested log directory.
#[test]
fn writer_creates_nested_directory() {
    let temp = tempfile::tempdir().expect("temp dir");
    let log_dir = temp.path().join("nested").join("audit");
    assert!(!log_dir.exists());

    let writer = JsonlAuditWriter::new(log_dir.clone()).expect("writer");
    assert!(log_dir.is_dir());

    writer
        .log_entry(AuditEntry::new(AuditEventType::ProcessReady))
        .expect("first write");
}

/// A denial entry serializes every populated field.
#[test]
fn denial_entry_written_to_jsonl() {
    let temp = tempfile::tempdir().expect("temp dir");
    let writer = JsonlAuditWriter::new(temp.path()).expect("writer");
    writer.log_entry(denial(4)).expect("log denial");

    let jsonl = single_audit_file(temp.path());
    let value: serde_json::Value = serde_json::from_str(jsonl.trim()).expect("json line");
    assert_eq!(value["event_type"], "broker_denied");
    assert_eq!(value["process_id"], 4);
    assert_eq!(value["role"], "renderer");
    assert_eq!(value["capability"], "file_read");
    assert_eq!(value["reason"], "permission denied");
    assert_eq!(value["sequence"], 7);
}

/// Files are named after the UTC date of the write.
#[test]
fn file_named_after_utc_date() {
    let temp = tempfile::tempdir().expect("temp dir");
    let writer = JsonlAuditWriter::new(temp.path()).expect("writer");
    writer
        .log_entry(AuditEntry::new(AuditEventType::ProcessExited))
        .expect("log");

    let today = chrono::Utc::now().date_naive();
    let expected = writer.path_for(today);
    assert_eq!(
        expected.file_name().and_then(|name| name.to_str()),
        Some(format!("bus-audit-{today}.jsonl").as_str())
    );
    assert!(expected.exists(), "expected {} to exist", expected.display());
}

/// Entries written on the same day land in one file, in order.
#[test]
fn same_day_entries_share_a_file() {
    let temp = tempfile::tempdir().expect("temp dir");
    let writer = JsonlAuditWriter::new(temp.path()).expect("writer");
    for id in 1..=5 {
        writer.log_entry(denial(id)).expect("log");
    }

    let jsonl = single_audit_file(temp.path());
    let ids: Vec<u64> = jsonl
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("json line");
            value["process_id"].as_u64().expect("process id")
        })
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

/// Concurrent writers never interleave partial lines.
#[test]
fn concurrent_denials_stay_line_atomic() {
    let temp = tempfile::tempdir().expect("temp dir");
    let writer = Arc::new(JsonlAuditWriter::new(temp.path()).expect("writer"));

    let threads: Vec<_> = (0..10)
        .map(|id| {
            let writer = Arc::clone(&writer);
            std::thread::spawn(move || writer.log_entry(denial(id)).expect("concurrent write"))
        })
        .collect();
    for thread in threads {
        thread.join().expect("writer thread");
    }

    let jsonl = single_audit_file(temp.path());
    assert_eq!(jsonl.lines().count(), 10);
    for line in jsonl.lines() {
        serde_json::from_str::<AuditEntry>(line).expect("each line is an entry");
    }
}

// ── Memory log ────────────────────────────────────────────────────────────────

/// The memory log filters by event type and by process.
#[test]
fn memory_log_filters() {
    let log = MemoryAuditLog::new();
    log.log_entry(denial(1)).expect("log");
    log.log_entry(
        AuditEntry::new(AuditEventType::ProcessReady)
            .with_process(ProcessId(2))
            .with_role("network"),
    )
    .expect("log");
    log.log_entry(denial(2)).expect("log");

    assert_eq!(log.entries().len(), 3);
    assert_eq!(log.of_type(AuditEventType::BrokerDenied).len(), 2);

    let history = log.history(ProcessId(2));
    let types: Vec<AuditEventType> = history.iter().map(|entry| entry.event_type).collect();
    assert_eq!(
        types,
        vec![AuditEventType::ProcessReady, AuditEventType::BrokerDenied]
    );
}
