//! Randomized operation sequences against the registry and scheduler.


use proptest::prelude::*;
use taskfleet::registry::{JobSpec, JobStatus};
use test_harness::{
    failure_report, heartbeat, registration, success_report, test_registry, test_scheduler,
};

const WORKERS: [&str; 3] = ["w0", "w1", "w2"];

#[derive(Debug, Clone)]
enum Op {
    Submit { cpu: u32, ram_mb: u64 },
    Pass,
    Poll(usize),
    Succeed(usize),
    Fail(usize),
    Cancel(usize),
    Heartbeat(usize),
    Reregister(usize),
    Advance(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..=4, prop::sample::select(vec![64u64, 256, 512, 1024]))
            .prop_map(|(cpu, ram_mb)| Op::Submit { cpu, ram_mb }),
        3 => Just(Op::Pass),
        2 => (0..WORKERS.len()).prop_map(Op::Poll),
        2 => any::<usize>().prop_map(Op::Succeed),
        2 => any::<usize>().prop_map(Op::Fail),
        1 => any::<usize>().prop_map(Op::Cancel),
        2 => (0..WORKERS.len()).prop_map(Op::Heartbeat),
        1 => (0..WORKERS.len()).prop_map(Op::Reregister),
        1 => (0i64..40_000).prop_map(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_for_any_interleaving(ops in prop::collection::vec(op(), 1..60)) {
        let (registry, clock) = test_registry();
        let scheduler = test_scheduler(&registry);
        for (i, id) in WORKERS.iter().enumerate() {
            registry.register_worker(registration(id, 2 + i as u32, 2048)).unwrap();
        }

        for op in ops {
            let succeed = matches!(op, Op::Succeed(_));
            match op {
                Op::Submit { cpu, ram_mb } => {
                    registry.submit_job(JobSpec {
                        required_cpu: Some(cpu),
                        required_ram_mb: Some(ram_mb),
                        ..JobSpec::command("true")
                    }).unwrap();
                }
                Op::Pass => {
                    scheduler.run_pass().unwrap();
                }
                Op::Poll(w) => {
                    let _ = registry.poll_for_job(WORKERS[w]);
                }
                Op::Succeed(k) | Op::Fail(k) => {
                    let in_flight = registry.in_flight_jobs().unwrap();
                    if !in_flight.is_empty() {
                        let job = &in_flight[k % in_flight.len()];
                        let owner = job.assigned_worker_id.clone().unwrap();
                        let report = if succeed {
                            success_report("ok")
                        } else {
                            failure_report(1)
                        };
                        registry.submit_result(&job.job_id, &owner, report).unwrap();
                    }
                }
                Op::Cancel(k) => {
                    let jobs = registry.jobs().unwrap();
                    if !jobs.is_empty() {
                        let job = &jobs[k % jobs.len()];
                        let result = registry.cancel_job(&job.job_id);
                        prop_assert_eq!(result.is_ok(), !job.status.is_terminal());
                    }
                }
                Op::Heartbeat(w) => {
                    registry.record_heartbeat(WORKERS[w], heartbeat(2048)).unwrap();
                }
                Op::Reregister(w) => {
                    registry
                        .register_worker(registration(WORKERS[w], 2 + w as u32, 2048))
                        .unwrap();
                }
                Op::Advance(ms) => clock.advance_ms(ms),
            }

            let violations = registry.check_invariants().unwrap();
            prop_assert!(violations.is_empty(), "violations: {:?}", violations);
        }

        // Releasing everything that was reserved leaves every worker empty.
        for job in registry.jobs().unwrap() {
            if !job.status.is_terminal() {
                registry.cancel_job(&job.job_id).unwrap();
            }
        }
        for w in registry.workers().unwrap() {
            prop_assert_eq!(w.reserved_cpu, 0);
            prop_assert_eq!(w.reserved_ram_mb, 0);
            prop_assert!(w.current_job_ids.is_empty());
        }
        prop_assert!(registry
            .jobs()
            .unwrap()
            .iter()
            .all(|j| j.status.is_terminal() && j.assigned_worker_id.is_none()));
        prop_assert!(registry.jobs_with_status(JobStatus::Running).unwrap().is_empty());
    }

    #[test]
    fn reserve_then_cancel_restores_capacity(
        jobs in prop::collection::vec((1u32..=3, 1u64..=700), 1..12)
    ) {
        let (registry, _clock) = test_registry();
        let before = registry.register_worker(registration("w", 4, 2048)).unwrap();

        let mut reserved = Vec::new();
        for (cpu, ram_mb) in jobs {
            let job = registry.submit_job(JobSpec {
                required_cpu: Some(cpu),
                required_ram_mb: Some(ram_mb),
                ..JobSpec::command("true")
            }).unwrap();
            // Over-capacity attempts are rejected without side effects.
            if registry.reserve(&job.job_id, "w").is_ok() {
                reserved.push(job.job_id);
            }
            let w = registry.worker("w").unwrap();
            prop_assert!(w.reserved_cpu <= w.cpu_count);
            prop_assert!(w.reserved_ram_mb <= w.ram_total_mb);
        }

        for job_id in reserved.iter().rev() {
            registry.cancel_job(job_id).unwrap();
        }
        let after = registry.worker("w").unwrap();
        prop_assert_eq!(after.reserved_cpu, before.reserved_cpu);
        prop_assert_eq!(after.reserved_ram_mb, before.reserved_ram_mb);
        prop_assert_eq!(after.current_job_ids, before.current_job_ids);
        prop_assert_eq!(after.status, before.status);
    }
}
