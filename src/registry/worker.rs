use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Unhealthy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "IDLE"),
            WorkerStatus::Busy => write!(f, "BUSY"),
            WorkerStatus::Unhealthy => write!(f, "UNHEALTHY"),
            WorkerStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// What an agent tells the coordinator about itself when it registers.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    /// Previously assigned id, if the agent has one.
    pub worker_id: Option<String>,
    pub hostname: String,
    pub os: String,
    pub cpu_count: u32,
    pub ram_total_mb: u64,
    pub max_parallel_jobs: u32,
}

/// Periodic liveness and usage report.
#[derive(Debug, Clone)]
pub struct HeartbeatReport {
    pub cpu_usage_percent: f64,
    pub ram_free_mb: u64,
    pub ram_total_mb: u64,
    /// Status computed by the agent; only UNHEALTHY is taken at face value.
    pub status: WorkerStatus,
    /// Jobs the agent is currently executing.
    pub running_job_ids: Vec<Uuid>,
}

/// Worker state tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub os: String,
    pub cpu_count: u32,
    pub ram_total_mb: u64,
    pub max_parallel_jobs: u32,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub cpu_usage_percent: f64,
    pub ram_free_mb: u64,
    pub reserved_cpu: u32,
    pub reserved_ram_mb: u64,
    pub current_job_ids: BTreeSet<Uuid>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(worker_id: String, reg: &WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            worker_id,
            hostname: reg.hostname.clone(),
            os: reg.os.clone(),
            cpu_count: reg.cpu_count,
            ram_total_mb: reg.ram_total_mb,
            max_parallel_jobs: reg.max_parallel_jobs.max(1),
            status: WorkerStatus::Idle,
            registered_at: now,
            last_heartbeat_at: now,
            cpu_usage_percent: 0.0,
            ram_free_mb: reg.ram_total_mb,
            reserved_cpu: 0,
            reserved_ram_mb: 0,
            current_job_ids: BTreeSet::new(),
            cooldown_until: None,
        }
    }

    pub fn free_cpu(&self) -> u32 {
        self.cpu_count.saturating_sub(self.reserved_cpu)
    }

    pub fn free_ram_mb(&self) -> u64 {
        self.ram_total_mb.saturating_sub(self.reserved_ram_mb)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat_at > timeout
    }

    /// Healthy, reachable and not serving a cooldown.
    pub fn accepts_work(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy) && !self.in_cooldown(now)
    }

    pub fn has_slot(&self) -> bool {
        (self.current_job_ids.len() as u32) < self.max_parallel_jobs
    }

    /// Admission check. Reservations are authoritative; the live free-RAM
    /// figure from the last heartbeat is an additional filter.
    pub fn fits(&self, required_cpu: u32, required_ram_mb: u64) -> bool {
        self.has_slot()
            && self.free_cpu() >= required_cpu
            && self.free_ram_mb() >= required_ram_mb
            && self.ram_free_mb >= required_ram_mb
    }

    /// Commit capacity to a job. Fails without side effects if the worker
    /// no longer has room.
    pub fn reserve(&mut self, job_id: Uuid, cpu: u32, ram_mb: u64) -> Result<()> {
        if self.current_job_ids.contains(&job_id) {
            return Err(FleetError::Conflict(format!(
                "job {} already reserved on worker {}",
                job_id, self.worker_id
            )));
        }
        if !self.fits(cpu, ram_mb) {
            return Err(FleetError::Conflict(format!(
                "worker {} has no headroom for {} cpu / {} MB (free {} cpu / {} MB, {} of {} slots used)",
                self.worker_id,
                cpu,
                ram_mb,
                self.free_cpu(),
                self.free_ram_mb(),
                self.current_job_ids.len(),
                self.max_parallel_jobs
            )));
        }
        self.reserved_cpu += cpu;
        self.reserved_ram_mb += ram_mb;
        self.current_job_ids.insert(job_id);
        self.refresh_status();
        Ok(())
    }

    /// Give back what [`reserve`](Self::reserve) took. Returns false if the
    /// worker was not holding the job.
    pub fn release(&mut self, job_id: &Uuid, cpu: u32, ram_mb: u64) -> bool {
        if !self.current_job_ids.remove(job_id) {
            return false;
        }
        self.reserved_cpu = self.reserved_cpu.saturating_sub(cpu);
        self.reserved_ram_mb = self.reserved_ram_mb.saturating_sub(ram_mb);
        self.refresh_status();
        true
    }

    /// Recompute IDLE/BUSY. UNHEALTHY and OFFLINE are left alone.
    pub fn refresh_status(&mut self) {
        if matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy) {
            self.status = if self.current_job_ids.is_empty() {
                WorkerStatus::Idle
            } else {
                WorkerStatus::Busy
            };
        }
    }

    /// Bring an OFFLINE or UNHEALTHY worker back into the schedulable set.
    pub fn revive(&mut self) {
        self.status = WorkerStatus::Idle;
        self.refresh_status();
    }

    /// Update advertised capacity without ever dropping below what is
    /// already reserved.
    pub fn set_capacity(&mut self, cpu_count: u32, ram_total_mb: u64) {
        if cpu_count >= self.reserved_cpu {
            self.cpu_count = cpu_count;
        } else {
            tracing::warn!(
                worker_id = %self.worker_id,
                cpu_count,
                reserved_cpu = self.reserved_cpu,
                "Advertised CPU below reservations, keeping previous capacity"
            );
        }
        if ram_total_mb >= self.reserved_ram_mb {
            self.ram_total_mb = ram_total_mb;
        } else {
            tracing::warn!(
                worker_id = %self.worker_id,
                ram_total_mb,
                reserved_ram_mb = self.reserved_ram_mb,
                "Advertised RAM below reservations, keeping previous capacity"
            );
        }
    }

    /// Reservation saturation in `[0, 1]`: the fuller of CPU and RAM.
    pub fn saturation(&self) -> f64 {
        let cpu = if self.cpu_count == 0 {
            1.0
        } else {
            self.reserved_cpu as f64 / self.cpu_count as f64
        };
        let ram = if self.ram_total_mb == 0 {
            1.0
        } else {
            self.reserved_ram_mb as f64 / self.ram_total_mb as f64
        };
        cpu.max(ram).clamp(0.0, 1.0)
    }
}
