use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;
use crate::registry::{JobRecord, WorkerRecord};

/// Weights of the placement load score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadWeights {
    pub cpu_usage: f64,
    pub saturation: f64,
}

impl From<&SchedulerConfig> for LoadWeights {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            cpu_usage: config.cpu_usage_weight,
            saturation: config.saturation_weight,
        }
    }
}

impl Default for LoadWeights {
    fn default() -> Self {
        (&SchedulerConfig::default()).into()
    }
}

/// Composite load of a worker. Lower is better.
pub fn load_score(worker: &WorkerRecord, weights: LoadWeights) -> f64 {
    let usage = (worker.cpu_usage_percent / 100.0).clamp(0.0, 1.0);
    weights.cpu_usage * usage + weights.saturation * worker.saturation()
}

/// Workers able to take `job` right now, best first.
///
/// Workers that already failed this job sort after every other eligible
/// worker. Within each group the lowest load score wins, then the earliest
/// registration.
pub fn candidates<'a>(
    job: &JobRecord,
    workers: &'a [WorkerRecord],
    now: DateTime<Utc>,
    weights: LoadWeights,
) -> Vec<&'a WorkerRecord> {
    let mut eligible: Vec<(bool, f64, &WorkerRecord)> = workers
        .iter()
        .filter(|w| w.accepts_work(now) && w.fits(job.required_cpu, job.required_ram_mb))
        .map(|w| {
            (
                job.failed_workers.contains(&w.worker_id),
                load_score(w, weights),
                w,
            )
        })
        .collect();

    eligible.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .then_with(|| a.2.registered_at.cmp(&b.2.registered_at))
            .then_with(|| a.2.worker_id.cmp(&b.2.worker_id))
    });
    eligible.into_iter().map(|(_, _, w)| w).collect()
}

/// The best candidate, if any.
pub fn best_fit<'a>(
    job: &JobRecord,
    workers: &'a [WorkerRecord],
    now: DateTime<Utc>,
    weights: LoadWeights,
) -> Option<&'a WorkerRecord> {
    candidates(job, workers, now, weights).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobDefaults;
    use crate::registry::{JobSpec, WorkerRegistration, WorkerStatus};
    use chrono::Duration;
    use uuid::Uuid;

    fn worker(id: &str, cpu: u32, ram: u64, registered_at: DateTime<Utc>) -> WorkerRecord {
        let reg = WorkerRegistration {
            worker_id: Some(id.to_string()),
            hostname: id.to_string(),
            os: "linux".to_string(),
            cpu_count: cpu,
            ram_total_mb: ram,
            max_parallel_jobs: 4,
        };
        WorkerRecord::new(id.to_string(), &reg, registered_at)
    }

    fn job(cpu: u32, ram: u64) -> JobRecord {
        let spec = JobSpec {
            required_cpu: Some(cpu),
            required_ram_mb: Some(ram),
            ..JobSpec::command("true")
        };
        JobRecord::new(spec, &JobDefaults::default(), Utc::now()).unwrap()
    }

    #[test]
    fn picks_least_loaded() {
        let now = Utc::now();
        let mut busy = worker("busy", 4, 4096, now);
        busy.cpu_usage_percent = 90.0;
        let quiet = worker("quiet", 4, 4096, now + Duration::seconds(1));
        let workers = vec![busy, quiet];

        let best = best_fit(&job(1, 256), &workers, now, LoadWeights::default()).unwrap();
        assert_eq!(best.worker_id, "quiet");
    }

    #[test]
    fn saturation_counts_reservations() {
        let now = Utc::now();
        let mut full = worker("full", 4, 4096, now);
        full.reserve(Uuid::new_v4(), 3, 512).unwrap();
        let empty = worker("empty", 4, 4096, now + Duration::seconds(1));
        let workers = vec![full, empty];

        let order: Vec<_> = candidates(&job(1, 256), &workers, now, LoadWeights::default())
            .iter()
            .map(|w| w.worker_id.as_str())
            .collect();
        assert_eq!(order, vec!["empty", "full"]);
    }

    #[test]
    fn ties_go_to_earliest_registration() {
        let now = Utc::now();
        let workers = vec![
            worker("late", 2, 1024, now + Duration::seconds(5)),
            worker("early", 2, 1024, now),
        ];
        let best = best_fit(&job(1, 256), &workers, now, LoadWeights::default()).unwrap();
        assert_eq!(best.worker_id, "early");
    }

    #[test]
    fn skips_ineligible_workers() {
        let now = Utc::now();
        let mut offline = worker("offline", 8, 8192, now);
        offline.status = WorkerStatus::Offline;
        let mut unhealthy = worker("unhealthy", 8, 8192, now);
        unhealthy.status = WorkerStatus::Unhealthy;
        let mut cooling = worker("cooling", 8, 8192, now);
        cooling.cooldown_until = Some(now + Duration::seconds(10));
        let small = worker("small", 2, 8192, now);
        let mut low_mem = worker("low-mem", 8, 8192, now);
        low_mem.ram_free_mb = 100;
        let workers = vec![offline, unhealthy, cooling, small, low_mem];

        assert!(best_fit(&job(4, 256), &workers, now, LoadWeights::default()).is_none());
    }

    #[test]
    fn previous_failures_are_a_last_resort() {
        let now = Utc::now();
        let workers = vec![
            worker("a", 4, 4096, now),
            worker("b", 4, 4096, now + Duration::seconds(1)),
        ];
        let mut retried = job(1, 256);
        retried.failed_workers.insert("a".to_string());

        let best = best_fit(&retried, &workers, now, LoadWeights::default()).unwrap();
        assert_eq!(best.worker_id, "b");

        let only_a = &workers[..1];
        let best = best_fit(&retried, only_a, now, LoadWeights::default()).unwrap();
        assert_eq!(best.worker_id, "a");
    }
}
