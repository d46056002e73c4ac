use lazy_batch::{
    BatchError, ConversionOptions, Converted, Converter, DestinationPlanner, EventBuffer,
    ExtensionScanner, JobSpec, PoolConfig, PoolController, PoolState, Task, TaskId,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fails_when_marked() -> Arc<dyn Converter> {
    Arc::new(|task: &Task| -> Result<Converted, BatchError> {
        if task.source().to_string_lossy().contains("-fail") {
            Err(BatchError::conversion_failed(
                task.source().display().to_string(),
                "marked to fail",
            ))
        } else {
            Ok(Converted {
                bytes_in: 3,
                bytes_out: 2,
            })
        }
    })
}

fn feed(pattern: &[bool]) -> Vec<Task> {
    pattern
        .iter()
        .enumerate()
        .map(|(i, fails)| {
            let name = if *fails {
                format!("in/{i}-fail.heic")
            } else {
                format!("in/{i}.heic")
            };
            Task::new(name, format!("out/{i}.jpg"), ConversionOptions::default())
        })
        .collect()
}

fn pool_shape() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=4, 1usize..=8)
}

fn relative_dirs() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{1,8}", 0..4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every submitted task yields exactly one result, whatever the pool shape,
    /// the failure pattern or when a pause lands.
    #[test]
    fn exactly_one_result_per_task(
        (workers, capacity) in pool_shape(),
        pattern in prop::collection::vec(any::<bool>(), 0..40),
        pause in any::<bool>(),
    ) {
        let events = Arc::new(EventBuffer::new(128));
        let config = PoolConfig::default()
            .with_workers(workers)
            .with_queue_capacity(capacity);
        let pool = PoolController::new(config, fails_when_marked())
            .unwrap()
            .with_event_sink(events.clone());

        let tasks = feed(&pattern);
        let expected: HashSet<TaskId> = tasks.iter().map(|t| t.id()).collect();
        pool.start(tasks.into_iter().map(Ok)).unwrap();

        if pause && pool.pause().is_ok() {
            thread::sleep(Duration::from_millis(2));
            // a paused run whose work already drained settles on its own
            let resumed = pool.resume();
            prop_assert!(resumed.is_ok() || pool.state() == PoolState::Idle);
        }
        prop_assert_eq!(pool.wait(), PoolState::Idle);

        let failures = pattern.iter().filter(|f| **f).count() as u64;
        let snap = pool.snapshot();
        prop_assert_eq!(snap.submitted, pattern.len() as u64);
        prop_assert_eq!(snap.failed, failures);
        prop_assert_eq!(snap.succeeded, pattern.len() as u64 - failures);
        prop_assert_eq!(snap.in_flight, 0);
        prop_assert!(pool.queue_high_water() <= capacity);

        let results = events.drain();
        prop_assert_eq!(results.len(), pattern.len());
        let seen: HashSet<TaskId> = results.iter().map(|r| r.task_id).collect();
        prop_assert_eq!(seen, expected);
    }

    /// After stop() every submitted task has a result and nothing is in flight.
    #[test]
    fn stop_accounts_for_every_task(
        (workers, capacity) in pool_shape(),
        n in 0usize..60,
        delay_us in 0u64..300,
    ) {
        let converter: Arc<dyn Converter> = Arc::new(move |_: &Task| -> Result<Converted, BatchError> {
            thread::sleep(Duration::from_micros(delay_us));
            Ok(Converted::default())
        });
        let config = PoolConfig::default()
            .with_workers(workers)
            .with_queue_capacity(capacity)
            .with_stop_grace(Duration::from_secs(10));
        let pool = PoolController::new(config, converter).unwrap();
        pool.start(feed(&vec![false; n]).into_iter().map(Ok)).unwrap();

        let report = pool.stop();
        prop_assert!(!report.timed_out);
        prop_assert!(pool.state().is_settled());

        let snap = pool.snapshot();
        prop_assert_eq!(snap.in_flight, 0);
        prop_assert_eq!(snap.completed(), snap.submitted);
        prop_assert!(snap.submitted <= n as u64);
        // nothing is cancelled before the stop, so its count is the whole story
        prop_assert_eq!(snap.cancelled, report.discarded as u64);
    }

    /// Destinations mirror the source's directory below the output root.
    #[test]
    fn destination_mirrors_relative_path(dirs in relative_dirs(), stem in "[a-zA-Z0-9_]{1,12}") {
        let root = PathBuf::from("/library");
        let mut parent = root.clone();
        for dir in &dirs {
            parent.push(dir);
        }
        let source = parent.join(format!("{stem}.heic"));

        let spec = JobSpec::new(&root).with_output_dir("/converted");
        let destination = spec.destination_for(&source);

        let mut expected = PathBuf::from("/converted");
        for dir in &dirs {
            expected.push(dir);
        }
        expected.push(format!("{stem}.jpg"));
        prop_assert_eq!(destination, expected);

        let flat = spec.with_preserve_structure(false).destination_for(&source);
        prop_assert_eq!(flat, Path::new("/converted").join(format!("{stem}.jpg")));
    }

    /// Flattening many folders into one never plans the same output twice.
    #[test]
    fn flattened_destinations_are_unique(
        sources in prop::collection::vec(("[a-c]{1,2}", "IMG_000[0-3]"), 1..40),
    ) {
        let spec = JobSpec::new("/library")
            .with_output_dir("/converted")
            .with_preserve_structure(false);
        let mut planner = DestinationPlanner::new().protecting(["heic"]);
        let mut seen = HashSet::new();
        let mut distinct_sources = HashSet::new();
        for (dir, stem) in &sources {
            let source = Path::new("/library").join(dir).join(format!("{stem}.heic"));
            if !distinct_sources.insert(source.clone()) {
                continue;
            }
            let task = planner.plan(&spec, &source);
            prop_assert_eq!(task.destination().parent(), Some(Path::new("/converted")));
            prop_assert!(seen.insert(task.destination().to_path_buf()));
        }
        prop_assert_eq!(planner.claimed(), distinct_sources.len());
    }

    /// Extension matching ignores case and a leading dot.
    #[test]
    fn extension_matching_is_case_insensitive(ext in "[a-z]{1,5}", upper in any::<bool>(), dotted in any::<bool>()) {
        let configured = if dotted { format!(".{ext}") } else { ext.clone() };
        let scanner = ExtensionScanner::new([configured]);
        let on_disk = if upper { ext.to_uppercase() } else { ext.clone() };
        let candidate = format!("photo.{on_disk}");
        prop_assert!(scanner.matches(Path::new(&candidate)));
        let other = format!("photo.{ext}x");
        prop_assert!(!scanner.matches(Path::new(&other)));
    }
}
