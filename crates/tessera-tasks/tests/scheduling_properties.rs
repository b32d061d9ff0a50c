use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tessera_core::SchedulerConfig;
use tessera_tasks::{
    CollectingReporter, ExecutionStatus, ManualSampler, ResourceGovernor, ScriptedExecutor,
    SchedulerOptions, TaskDag, TaskId, TaskScheduler, TaskSpec, TaskStatus,
};

/// A task graph plus the tasks whose every attempt fails.
#[derive(Debug, Clone)]
struct Scenario {
    deps: Vec<BTreeSet<usize>>,
    failing: BTreeSet<usize>,
    max_parallel: usize,
    max_retries: u32,
}

// Acyclic by construction: task N only depends on tasks 0..N-1.
fn scenario_strategy(max_tasks: usize) -> impl Strategy<Value = Scenario> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), num_tasks),
            proptest::collection::vec(any::<bool>(), num_tasks),
            1..=4usize,
            0..=1u32,
        )
            .prop_map(|(raw_deps, fails, max_parallel, max_retries)| Scenario {
                deps: raw_deps
                    .into_iter()
                    .enumerate()
                    .map(|(i, raw)| {
                        if i == 0 {
                            BTreeSet::new()
                        } else {
                            raw.into_iter().map(|d| d % i).collect()
                        }
                    })
                    .collect(),
                // roughly one task in four fails
                failing: fails
                    .iter()
                    .enumerate()
                    .filter(|(i, f)| **f && i % 2 == 0)
                    .map(|(i, _)| i)
                    .collect(),
                max_parallel,
                max_retries,
            })
    })
}

fn name(i: usize) -> String {
    format!("app{}-unit", i)
}

fn run_scenario(scenario: &Scenario) -> (tessera_tasks::RunSummary, Arc<ScriptedExecutor>) {
    let mut executor = ScriptedExecutor::new().with_delay(Duration::from_millis(2));
    for i in &scenario.failing {
        executor = executor.with_script(name(*i), [ExecutionStatus::Failed]);
    }
    let executor = Arc::new(executor);

    let tasks = scenario.deps.iter().enumerate().map(|(i, deps)| {
        let mut spec = TaskSpec::new(name(i))
            .with_command(format!("run {}", name(i)))
            .with_max_retries(scenario.max_retries);
        for dep in deps {
            spec = spec.with_dependency(name(*dep));
        }
        spec.into_task(Duration::from_secs(60), 0)
    });
    let mut dag = TaskDag::build(tasks).unwrap();

    let options = SchedulerOptions::from_config(&SchedulerConfig::default(), std::env::temp_dir())
        .with_max_parallel(scenario.max_parallel)
        .with_retry_delay(Duration::from_millis(1))
        .with_waits(Duration::from_millis(5), Duration::from_millis(5))
        .with_sample_interval(Duration::from_millis(50));
    let governor = Arc::new(ResourceGovernor::new(
        options.limits(),
        Arc::new(ManualSampler::idle()),
    ));
    let scheduler = TaskScheduler::new(
        options,
        executor.clone(),
        Arc::new(CollectingReporter::default()),
    )
    .with_governor(governor);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let summary = runtime.block_on(scheduler.run(&mut dag)).unwrap();
    (summary, executor)
}

/// Tasks that can never pass: failing ones and everything downstream
fn doomed(scenario: &Scenario) -> HashSet<usize> {
    let mut doomed = HashSet::new();
    for (i, deps) in scenario.deps.iter().enumerate() {
        if scenario.failing.contains(&i) || deps.iter().any(|d| doomed.contains(d)) {
            doomed.insert(i);
        }
    }
    doomed
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_run_respects_dependencies_and_limits(scenario in scenario_strategy(8)) {
        let (summary, executor) = run_scenario(&scenario);

        prop_assert_eq!(summary.total, scenario.deps.len());
        prop_assert!(executor.max_concurrency() <= scenario.max_parallel);

        for (i, deps) in scenario.deps.iter().enumerate() {
            let record = summary.get(&name(i)).unwrap();
            prop_assert!(record.retry_count <= scenario.max_retries);

            if let Some(started) = record.start_time {
                for dep in deps {
                    let dep_record = summary.get(&name(*dep)).unwrap();
                    prop_assert_eq!(dep_record.status, TaskStatus::Passed);
                    prop_assert!(dep_record.end_time.unwrap() <= started);
                }
            }
        }
    }

    #[test]
    fn prop_failures_cascade_and_quarantine(scenario in scenario_strategy(8)) {
        let (summary, executor) = run_scenario(&scenario);
        let doomed = doomed(&scenario);
        let started: HashSet<TaskId> = executor.started().into_iter().collect();

        for i in 0..scenario.deps.len() {
            let record = summary.get(&name(i)).unwrap();
            let id = TaskId::new(name(i));
            if scenario.failing.contains(&i) && !doomed_by_dependency(&scenario, &doomed, i) {
                prop_assert_eq!(record.status, TaskStatus::Failed);
                prop_assert_eq!(record.attempts, scenario.max_retries + 1);
                prop_assert!(summary.quarantined.contains(&id));
            } else if doomed.contains(&i) {
                prop_assert_eq!(record.status, TaskStatus::Skipped);
                prop_assert!(!started.contains(&id));
            } else {
                prop_assert_eq!(record.status, TaskStatus::Passed);
            }
        }
        prop_assert_eq!(summary.is_success(), scenario.failing.is_empty());
    }
}

/// A failing task whose own dependency is doomed never gets to run
fn doomed_by_dependency(scenario: &Scenario, doomed: &HashSet<usize>, i: usize) -> bool {
    scenario.deps[i].iter().any(|d| doomed.contains(d))
}
