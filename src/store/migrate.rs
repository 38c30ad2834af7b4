//! One-shot upgrade of persisted snapshots to the current record shape.
//!
//! Version 1 snapshots (or files with no version at all) were written with
//! camelCase keys, lowercase status strings, epoch-millisecond timestamps
//! and frequently missing fields. They are rewritten here, once, on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::JobDefaults;
use crate::error::{FleetError, Result};
use crate::registry::{JobRecord, JobStatus, WorkerRecord, WorkerStatus};

pub const SCHEMA_VERSION: u32 = 2;

/// On-disk layout of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub schema_version: u32,
    pub workers: Vec<WorkerRecord>,
    pub jobs: Vec<JobRecord>,
}

/// Turn any supported snapshot into the current layout.
pub fn upgrade(raw: Value) -> Result<SnapshotFile> {
    let version = raw
        .get("schema_version")
        .or_else(|| raw.get("schemaVersion"))
        .and_then(Value::as_u64)
        .unwrap_or(1);

    if version > SCHEMA_VERSION as u64 {
        return Err(FleetError::Store(format!(
            "snapshot schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }
    if version == SCHEMA_VERSION as u64 {
        return serde_json::from_value(raw)
            .map_err(|e| FleetError::Store(format!("malformed snapshot: {}", e)));
    }

    tracing::info!(from = version, to = SCHEMA_VERSION, "Migrating state snapshot");

    let mut workers = Vec::new();
    for record in records(raw.get("workers")) {
        match upgrade_worker(record) {
            Ok(worker) => workers.push(worker),
            Err(e) => tracing::warn!(error = %e, "Dropping unreadable legacy worker record"),
        }
    }
    let mut jobs = Vec::new();
    for record in records(raw.get("jobs")) {
        match upgrade_job(record) {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!(error = %e, "Dropping unreadable legacy job record"),
        }
    }

    Ok(SnapshotFile {
        schema_version: SCHEMA_VERSION,
        workers,
        jobs,
    })
}

/// Legacy collections were either arrays or objects keyed by id.
fn records(collection: Option<&Value>) -> Vec<Map<String, Value>> {
    match collection {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
        Some(Value::Object(by_id)) => by_id
            .iter()
            .filter_map(|(id, v)| {
                let mut record = v.as_object()?.clone();
                record.entry("id").or_insert_with(|| json!(id));
                Some(record)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn normalize_keys(record: Map<String, Value>, aliases: &[(&str, &str)]) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in record {
        let key = snake_case(&key);
        let key = aliases
            .iter()
            .find(|(legacy, _)| *legacy == key)
            .map(|(_, current)| current.to_string())
            .unwrap_or(key);
        if !value.is_null() {
            out.insert(key, value);
        }
    }
    out
}

fn fill(record: &mut Map<String, Value>, key: &str, default: Value) {
    record.entry(key).or_insert(default);
}

/// Epoch milliseconds become RFC 3339; strings are left for serde to parse.
fn timestamp(record: &mut Map<String, Value>, key: &str) {
    if let Some(ms) = record.get(key).and_then(Value::as_i64) {
        match DateTime::<Utc>::from_timestamp_millis(ms) {
            Some(at) => {
                record.insert(key.to_string(), json!(at.to_rfc3339()));
            }
            None => {
                record.remove(key);
            }
        }
    }
}

fn epoch() -> Value {
    json!("1970-01-01T00:00:00Z")
}

fn status_key(record: &Map<String, Value>) -> Option<String> {
    record
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase().replace(['-', ' '], "_"))
}

pub fn legacy_worker_status(status: &str) -> Option<WorkerStatus> {
    match status {
        "online" | "idle" | "available" | "ready" => Some(WorkerStatus::Idle),
        "busy" | "working" => Some(WorkerStatus::Busy),
        "unhealthy" | "degraded" | "error" => Some(WorkerStatus::Unhealthy),
        "offline" | "disconnected" | "dead" => Some(WorkerStatus::Offline),
        _ => None,
    }
}

pub fn legacy_job_status(status: &str) -> Option<JobStatus> {
    match status {
        "submitted" | "new" => Some(JobStatus::Submitted),
        "pending" | "queued" | "waiting" => Some(JobStatus::Queued),
        "assigned" => Some(JobStatus::Assigned),
        "running" | "in_progress" => Some(JobStatus::Running),
        "done" | "success" | "succeeded" | "completed" => Some(JobStatus::Completed),
        "error" | "failed" | "failure" => Some(JobStatus::Failed),
        "cancelled" | "canceled" => Some(JobStatus::Cancelled),
        "timeout" | "timed_out" | "retrying" | "timed_out_retrying" => {
            Some(JobStatus::TimedOutRetrying)
        }
        _ => None,
    }
}

const WORKER_ALIASES: &[(&str, &str)] = &[
    ("id", "worker_id"),
    ("last_heartbeat", "last_heartbeat_at"),
    ("cpu_usage", "cpu_usage_percent"),
    ("cpu_cores", "cpu_count"),
    ("ram_total", "ram_total_mb"),
    ("ram_free", "ram_free_mb"),
    ("current_jobs", "current_job_ids"),
    ("max_parallel", "max_parallel_jobs"),
];

fn upgrade_worker(record: Map<String, Value>) -> Result<WorkerRecord> {
    let mut w = normalize_keys(record, WORKER_ALIASES);

    let status = match status_key(&w) {
        Some(s) => legacy_worker_status(&s).unwrap_or_else(|| {
            tracing::warn!(status = %s, "Unrecognized legacy worker status, marking OFFLINE");
            WorkerStatus::Offline
        }),
        None => WorkerStatus::Offline,
    };
    w.insert("status".to_string(), json!(status));

    for key in ["last_heartbeat_at", "registered_at", "cooldown_until"] {
        timestamp(&mut w, key);
    }
    fill(&mut w, "last_heartbeat_at", epoch());
    let registered = w.get("last_heartbeat_at").cloned().unwrap_or_else(epoch);
    fill(&mut w, "registered_at", registered);

    fill(&mut w, "hostname", json!(""));
    fill(&mut w, "os", json!(""));
    fill(&mut w, "cpu_count", json!(0));
    fill(&mut w, "ram_total_mb", json!(0));
    fill(&mut w, "max_parallel_jobs", json!(1));
    fill(&mut w, "cpu_usage_percent", json!(0.0));
    fill(&mut w, "ram_free_mb", json!(0));
    // Reservations are rebuilt from the jobs when the registry opens.
    w.insert("reserved_cpu".to_string(), json!(0));
    w.insert("reserved_ram_mb".to_string(), json!(0));
    w.insert("current_job_ids".to_string(), json!([]));

    serde_json::from_value(Value::Object(w))
        .map_err(|e| FleetError::Store(format!("legacy worker: {}", e)))
}

const JOB_ALIASES: &[(&str, &str)] = &[
    ("id", "job_id"),
    ("worker_id", "assigned_worker_id"),
    ("assigned_worker", "assigned_worker_id"),
    ("created_at", "submitted_at"),
    ("finished_at", "completed_at"),
    ("output", "stdout"),
    ("error", "error_message"),
    ("retries", "attempts"),
    ("cpu", "required_cpu"),
    ("ram_mb", "required_ram_mb"),
    ("timeout", "timeout_ms"),
];

fn upgrade_job(record: Map<String, Value>) -> Result<JobRecord> {
    let mut j = normalize_keys(record, JOB_ALIASES);
    let defaults = JobDefaults::default();

    let status = match status_key(&j) {
        Some(s) => match legacy_job_status(&s) {
            Some(status) => status,
            None => {
                tracing::warn!(status = %s, "Unrecognized legacy job status, marking FAILED");
                j.insert(
                    "error_message".to_string(),
                    json!(format!("unrecognized legacy status {:?}", s)),
                );
                JobStatus::Failed
            }
        },
        None => JobStatus::Queued,
    };
    j.insert("status".to_string(), json!(status));

    for key in [
        "submitted_at",
        "queued_at",
        "assigned_at",
        "started_at",
        "completed_at",
        "retry_at",
    ] {
        timestamp(&mut j, key);
    }
    fill(&mut j, "submitted_at", epoch());

    fill(&mut j, "file_url", json!(""));
    fill(&mut j, "filename", json!(""));
    fill(&mut j, "required_cpu", json!(defaults.required_cpu));
    fill(&mut j, "required_ram_mb", json!(defaults.required_ram_mb));
    fill(&mut j, "timeout_ms", json!(defaults.timeout_ms));
    fill(&mut j, "max_retries", json!(defaults.max_retries));
    fill(&mut j, "attempts", json!(0));
    fill(&mut j, "failed_workers", json!([]));
    fill(&mut j, "stdout", json!(""));
    fill(&mut j, "stderr", json!(""));
    fill(&mut j, "timed_out", json!(false));

    let mut job: JobRecord = serde_json::from_value(Value::Object(j))
        .map_err(|e| FleetError::Store(format!("legacy job: {}", e)))?;

    // Only in-flight jobs may name an owner.
    if !job.status.is_in_flight() {
        if let Some(owner) = job.assigned_worker_id.take() {
            job.executed_by.get_or_insert(owner);
        }
    }
    job.attempts = job.attempts.min(job.max_retries + 1);
    if job.status == JobStatus::Submitted {
        job.status = JobStatus::Queued;
    }
    if job.status == JobStatus::Queued && job.queued_at.is_none() {
        job.queued_at = Some(job.submitted_at);
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_version_is_read_as_is() {
        let raw = json!({ "schema_version": 2, "workers": [], "jobs": [] });
        let snap = upgrade(raw).unwrap();
        assert_eq!(snap.schema_version, SCHEMA_VERSION);
        assert!(snap.workers.is_empty());
    }

    #[test]
    fn newer_version_is_refused() {
        let raw = json!({ "schema_version": 99, "workers": [], "jobs": [] });
        assert!(matches!(upgrade(raw), Err(FleetError::Store(_))));
    }

    #[test]
    fn legacy_worker_is_coerced() {
        let raw = json!({
            "workers": {
                "w-1": {
                    "hostname": "box",
                    "cpuCount": 4,
                    "ramTotalMb": 2048,
                    "status": "online",
                    "lastHeartbeat": 1_700_000_000_000i64
                }
            }
        });
        let snap = upgrade(raw).unwrap();
        let w = &snap.workers[0];
        assert_eq!(w.worker_id, "w-1");
        assert_eq!(w.status, WorkerStatus::Idle);
        assert_eq!(w.cpu_count, 4);
        assert_eq!(w.ram_total_mb, 2048);
        assert_eq!(w.last_heartbeat_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(w.registered_at, w.last_heartbeat_at);
        assert_eq!(w.reserved_cpu, 0);
        assert!(w.current_job_ids.is_empty());
        assert!(w.cooldown_until.is_none());
    }

    #[test]
    fn legacy_job_statuses_map_to_current() {
        let id = uuid::Uuid::new_v4();
        let raw = json!({
            "jobs": [
                { "id": id.to_string(), "command": "echo", "status": "done", "workerId": "w-1" },
                { "id": uuid::Uuid::new_v4().to_string(), "command": "ls", "status": "pending" },
                { "id": uuid::Uuid::new_v4().to_string(), "command": "x", "status": "timeout" },
                { "id": uuid::Uuid::new_v4().to_string(), "command": "y", "status": "error" },
            ]
        });
        let snap = upgrade(raw).unwrap();
        let by_cmd = |cmd: &str| snap.jobs.iter().find(|j| j.command == cmd).unwrap();

        let done = by_cmd("echo");
        assert_eq!(done.job_id, id);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.assigned_worker_id.is_none());
        assert_eq!(done.executed_by.as_deref(), Some("w-1"));

        let pending = by_cmd("ls");
        assert_eq!(pending.status, JobStatus::Queued);
        assert_eq!(pending.required_cpu, 1);
        assert_eq!(pending.max_retries, 2);
        assert!(pending.queued_at.is_some());

        assert_eq!(by_cmd("x").status, JobStatus::TimedOutRetrying);
        assert_eq!(by_cmd("y").status, JobStatus::Failed);
    }

    #[test]
    fn unreadable_records_are_dropped() {
        let raw = json!({
            "jobs": [
                { "id": "not-a-uuid", "command": "echo" },
                { "id": uuid::Uuid::new_v4().to_string(), "command": "ok" }
            ]
        });
        let snap = upgrade(raw).unwrap();
        assert_eq!(snap.jobs.len(), 1);
        assert_eq!(snap.jobs[0].command, "ok");
    }

    #[test]
    fn snake_case_conversion() {
        assert_eq!(snake_case("ramTotalMb"), "ram_total_mb");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }
}
