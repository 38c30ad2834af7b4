use std::collections::HashMap;

use uuid::Uuid;

use super::{JobRecord, WorkerRecord};

/// Check the cross-record invariants and describe every violation found.
///
/// - reservations never exceed advertised capacity, and parallelism bounds
///   `current_job_ids`
/// - a job names an owner iff it is ASSIGNED or RUNNING
/// - an in-flight job sits in exactly its owner's `current_job_ids`
/// - each worker's reservations are exactly the sum of its jobs' requirements
/// - `attempts <= max_retries + 1`
pub fn verify(workers: &[WorkerRecord], jobs: &[JobRecord]) -> Vec<String> {
    let mut violations = Vec::new();
    let jobs_by_id: HashMap<Uuid, &JobRecord> = jobs.iter().map(|j| (j.job_id, j)).collect();
    let mut holders: HashMap<Uuid, Vec<&str>> = HashMap::new();

    for w in workers {
        if w.reserved_cpu > w.cpu_count {
            violations.push(format!(
                "worker {} reserves {} cpu of {}",
                w.worker_id, w.reserved_cpu, w.cpu_count
            ));
        }
        if w.reserved_ram_mb > w.ram_total_mb {
            violations.push(format!(
                "worker {} reserves {} MB of {}",
                w.worker_id, w.reserved_ram_mb, w.ram_total_mb
            ));
        }
        if w.current_job_ids.len() as u32 > w.max_parallel_jobs {
            violations.push(format!(
                "worker {} holds {} jobs with parallelism {}",
                w.worker_id,
                w.current_job_ids.len(),
                w.max_parallel_jobs
            ));
        }

        let (mut cpu, mut ram) = (0u32, 0u64);
        for job_id in &w.current_job_ids {
            holders.entry(*job_id).or_default().push(&w.worker_id);
            match jobs_by_id.get(job_id) {
                Some(job) if job.is_owned_by(&w.worker_id) => {
                    cpu += job.required_cpu;
                    ram += job.required_ram_mb;
                }
                Some(job) => violations.push(format!(
                    "worker {} holds job {} which is {} for {:?}",
                    w.worker_id, job_id, job.status, job.assigned_worker_id
                )),
                None => violations.push(format!(
                    "worker {} holds unknown job {}",
                    w.worker_id, job_id
                )),
            }
        }
        if cpu != w.reserved_cpu || ram != w.reserved_ram_mb {
            violations.push(format!(
                "worker {} reserves {} cpu / {} MB but its jobs need {} / {}",
                w.worker_id, w.reserved_cpu, w.reserved_ram_mb, cpu, ram
            ));
        }
    }

    for job in jobs {
        if job.status.is_in_flight() != job.assigned_worker_id.is_some() {
            violations.push(format!(
                "job {} is {} with owner {:?}",
                job.job_id, job.status, job.assigned_worker_id
            ));
        }
        if job.attempts > job.max_retries + 1 {
            violations.push(format!(
                "job {} has {} attempts with max_retries {}",
                job.job_id, job.attempts, job.max_retries
            ));
        }
        let held_by = holders.get(&job.job_id).map(Vec::as_slice).unwrap_or(&[]);
        if job.status.is_in_flight() {
            let owner = job.assigned_worker_id.as_deref();
            if held_by.len() != 1 || Some(held_by[0]) != owner {
                violations.push(format!(
                    "job {} owned by {:?} is held by {:?}",
                    job.job_id, owner, held_by
                ));
            }
        }
    }

    violations
}
