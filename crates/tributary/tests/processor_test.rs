//! Tests for the aggregating queue processor

mod common;

use common::{by_id, config_without_timer, recording_handler, wait_for, Recorded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tributary::prelude::*;

type RecordingProcessor = AggregatingQueueProcessor<
    u64,
    Recorded,
    fn(&Recorded, &Package<u64>, &Span) -> std::result::Result<(), BoxError>,
>;

fn recording(config: ProcessorConfig) -> (RecordingProcessor, Arc<Recorded>) {
    common::init_tracing();
    let recorded = Arc::new(Recorded::default());
    let processor = AggregatingQueueProcessor::new(
        config,
        Arc::clone(&recorded),
        recording_handler as fn(&Recorded, &Package<u64>, &Span) -> _,
    )
    .unwrap();
    (processor, recorded)
}

fn flatten(packages: &[(u64, Vec<u64>)]) -> Vec<u64> {
    packages.iter().flat_map(|(_, items)| items.clone()).collect()
}

// ==================== Packaging Tests ====================

#[test]
fn test_packaging_preserves_order() {
    let (processor, recorded) = recording(config_without_timer(7));
    processor.start().unwrap();

    for i in 0..100 {
        processor.add(i).unwrap();
    }
    processor.stop().unwrap();

    let packages = by_id(&recorded);
    assert_eq!(packages.len(), 15); // ceil(100 / 7)
    assert!(packages[..14].iter().all(|(_, items)| items.len() == 7));
    assert_eq!(packages[14].1.len(), 2);
    assert_eq!(flatten(&packages), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_threshold_emits_single_full_package() {
    let (processor, recorded) = recording(config_without_timer(5));
    processor.start().unwrap();

    for i in 0..5 {
        processor.add(i).unwrap();
    }
    assert_eq!(processor.pending_items(), 0);
    assert_eq!(processor.total_pushed_items(), 5);

    processor.stop().unwrap();
    assert_eq!(by_id(&recorded), vec![(0, vec![0, 1, 2, 3, 4])]);
}

#[test]
fn test_timer_flushes_partial_package() {
    let config = config_without_timer(100).with_timer_period(Duration::from_millis(20));
    let (processor, recorded) = recording(config);
    processor.start().unwrap();

    processor.add_collection([1, 2, 3]).unwrap();
    assert!(wait_for(Duration::from_secs(5), || recorded.lock().len() == 1));
    assert_eq!(processor.pending_items(), 0);

    processor.stop().unwrap();
    assert_eq!(by_id(&recorded), vec![(0, vec![1, 2, 3])]);
}

#[test]
fn test_force_flush_splits_by_max_size() {
    let (processor, recorded) = recording(config_without_timer(4));
    processor.start().unwrap();

    // Stays below the threshold, so nothing is packaged yet
    processor.add_collection([1, 2, 3]).unwrap();
    assert_eq!(processor.pending_items(), 3);

    assert_eq!(processor.force_flush().unwrap(), 1);
    assert_eq!(processor.force_flush().unwrap(), 0);

    processor.stop().unwrap();
    assert_eq!(by_id(&recorded), vec![(0, vec![1, 2, 3])]);
}

#[test]
fn test_add_collection_counts_every_item() {
    let (processor, recorded) = recording(config_without_timer(4));
    processor.start().unwrap();

    processor.add_collection(0..10).unwrap();
    processor.add_collection(Vec::new()).unwrap();
    assert_eq!(processor.total_added_items(), 10);

    processor.stop().unwrap();
    let packages = by_id(&recorded);
    assert_eq!(flatten(&packages), (0..10).collect::<Vec<_>>());
    assert!(packages.iter().all(|(_, items)| items.len() <= 4));
}

// ==================== Manual Package Tests ====================

#[test]
fn test_add_package_bypasses_intake() {
    let (processor, recorded) = recording(config_without_timer(4));
    processor.start().unwrap();

    processor.add(1).unwrap();
    processor.add_package(vec![10, 11]).unwrap();
    assert_eq!(processor.pending_items(), 1);

    processor.stop().unwrap();
    // The injected package was formed first, the pending item only on stop
    assert_eq!(by_id(&recorded), vec![(0, vec![10, 11]), (1, vec![1])]);
    assert_eq!(processor.total_added_items(), 3);
}

#[test]
fn test_add_package_too_large() {
    let (processor, recorded) = recording(config_without_timer(2));
    processor.start().unwrap();

    let err = processor.add_package(vec![1, 2, 3]).unwrap_err();
    assert!(matches!(err, Error::PackageTooLarge { size: 3, max: 2 }));
    assert_eq!(err.category(), ErrorCategory::Capacity);

    processor.add_package(Vec::new()).unwrap();
    processor.stop().unwrap();

    assert!(recorded.lock().is_empty());
    assert_eq!(processor.total_added_items(), 0);
}

// ==================== Lifecycle Tests ====================

#[test]
fn test_add_requires_started() {
    let (processor, _) = recording(config_without_timer(4));

    let err = processor.add(1).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            operation: "add",
            state: State::Created
        }
    ));
    assert!(processor.add_collection([1, 2]).is_err());
    assert!(processor.add_package(vec![1]).is_err());
    assert!(processor.force_flush().is_err());
    assert_eq!(processor.total_added_items(), 0);

    processor.start().unwrap();
    processor.stop().unwrap();

    assert!(matches!(
        processor.add(1).unwrap_err(),
        Error::InvalidState {
            state: State::Stopped,
            ..
        }
    ));
    assert_eq!(processor.stats().total_added_items, 0);
    assert_eq!(processor.pending_items(), 0);
}

#[test]
fn test_state_transitions() {
    let (processor, _) = recording(config_without_timer(4));
    assert_eq!(processor.state(), State::Created);
    assert!(processor.stop().is_err());

    processor.start().unwrap();
    assert_eq!(processor.state(), State::Started);
    assert!(processor.start().is_err());

    processor.stop().unwrap();
    assert_eq!(processor.state(), State::Stopped);
    assert!(processor.stop().is_err());
    assert!(processor.start().is_err());

    processor.dispose();
    assert_eq!(processor.state(), State::Disposed);
    processor.dispose();
    assert_eq!(processor.state(), State::Disposed);
    assert!(processor.start().is_err());
}

#[test]
fn test_dispose_stops_and_drains() {
    let (processor, recorded) = recording(config_without_timer(10));
    processor.start().unwrap();
    processor.add_collection(0..25).unwrap();

    processor.dispose();

    assert_eq!(processor.state(), State::Disposed);
    assert_eq!(flatten(&by_id(&recorded)), (0..25).collect::<Vec<_>>());
}

#[test]
fn test_dispose_from_created() {
    let (processor, _) = recording(config_without_timer(10));
    processor.dispose();
    assert_eq!(processor.state(), State::Disposed);
    assert!(processor.add(1).is_err());
}

#[test]
fn test_drop_drains_started_processor() {
    let (processor, recorded) = recording(config_without_timer(10));
    processor.start().unwrap();
    processor.add_collection(0..3).unwrap();

    drop(processor);
    assert_eq!(flatten(&by_id(&recorded)), vec![0, 1, 2]);
}

#[test]
fn test_stats_after_stop() {
    let (processor, _) = recording(config_without_timer(2));
    processor.start().unwrap();
    processor.add_collection(0..4).unwrap();
    processor.stop().unwrap();

    let stats = processor.stats();
    assert_eq!(stats.state, State::Stopped);
    assert_eq!(stats.total_pushed_packages, 2);
    assert_eq!(stats.current_queue_size, 0);
}

#[test]
fn test_invalid_config_fails_fast() {
    let recorded = Arc::new(Recorded::default());
    let err = AggregatingQueueProcessor::new(
        config_without_timer(0),
        recorded,
        recording_handler as fn(&Recorded, &Package<u64>, &Span) -> _,
    )
    .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

// ==================== Worker Tests ====================

#[test]
fn test_handler_failure_is_reported_and_worker_continues() {
    common::init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let processor = AggregatingQueueProcessor::new(
        config_without_timer(2).with_processing_thread_count(1),
        Arc::clone(&calls),
        |calls: &AtomicUsize,
         package: &Package<u64>,
         _span: &Span|
         -> std::result::Result<(), BoxError> {
            calls.fetch_add(1, Ordering::SeqCst);
            if package.contains(&13) {
                return Err("unlucky package".into());
            }
            Ok(())
        },
    )
    .unwrap();
    let failures = processor.failures();

    processor.start().unwrap();
    processor.add_collection([12, 13, 14, 15]).unwrap();
    processor.stop().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.package_id, 0);
    assert_eq!(failure.items, 2);
    assert_eq!(failure.error.category(), ErrorCategory::Handler);
    assert!(failure.error.to_string().contains("unlucky package"));
    assert!(failures.try_recv().is_err());

    let stats = processor.stats();
    assert_eq!(stats.total_pushed_items, 4);
    assert_eq!(stats.total_processed_items, 2);
    assert_eq!(stats.total_failed_items, 2);
    assert_eq!(stats.total_failed_packages, 1);
}

#[test]
fn test_stop_waits_for_in_flight_packages() {
    common::init_tracing();
    let done = Arc::new(AtomicUsize::new(0));
    let processor = AggregatingQueueProcessor::new(
        config_without_timer(1).with_processing_thread_count(2),
        Arc::clone(&done),
        |done: &AtomicUsize,
         _package: &Package<u64>,
         _span: &Span|
         -> std::result::Result<(), BoxError> {
            thread::sleep(Duration::from_millis(20));
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();

    processor.start().unwrap();
    processor.add_collection(0..6).unwrap();
    processor.stop().unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 6);
    assert_eq!(processor.total_processed_items(), 6);
}

#[test]
fn test_full_processing_queue_applies_backpressure() {
    common::init_tracing();
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock();

    let processor = Arc::new(
        AggregatingQueueProcessor::new(
            config_without_timer(1)
                .with_processing_thread_count(1)
                .with_processing_queue_max_size(1),
            Arc::clone(&gate),
            |gate: &Mutex<()>,
             _package: &Package<u64>,
             _span: &Span|
             -> std::result::Result<(), BoxError> {
                drop(gate.lock());
                Ok(())
            },
        )
        .unwrap(),
    );
    processor.start().unwrap();

    let producer = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || {
            for i in 0..4 {
                processor.add(i).unwrap();
            }
        })
    };

    // One package blocks in the handler, one fills the queue, the producer waits
    assert!(wait_for(Duration::from_secs(5), || processor.current_queue_size() == 1
        && processor.total_pushed_items() == 2));
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());

    drop(held);
    producer.join().unwrap();
    processor.stop().unwrap();
    assert_eq!(processor.total_processed_items(), 4);
}

// ==================== Concurrency Tests ====================

#[test]
fn test_concurrent_producers_counter_consistency() {
    let config = config_without_timer(50)
        .with_processing_thread_count(4)
        .with_timer_period(Duration::from_millis(5));
    let (processor, recorded) = recording(config);
    let processor = Arc::new(processor);
    processor.start().unwrap();

    let producers: Vec<_> = (0..8u64)
        .map(|p| {
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                for i in 0..1_000u64 {
                    processor.add(p * 1_000 + i).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    processor.stop().unwrap();

    let stats = processor.stats();
    assert_eq!(stats.total_added_items, 8_000);
    assert_eq!(stats.total_pushed_items, stats.total_added_items);
    assert_eq!(stats.total_processed_items, stats.total_pushed_items);
    assert_eq!(stats.pending_items, 0);

    let packages = by_id(&recorded);
    assert!(packages.iter().all(|(_, items)| !items.is_empty() && items.len() <= 50));
    assert_eq!(packages.len() as u64, stats.total_pushed_packages);

    // Each producer's items keep their relative order across packages
    let items = flatten(&packages);
    for p in 0..8u64 {
        let own: Vec<u64> = items.iter().copied().filter(|i| i / 1_000 == p).collect();
        assert_eq!(own, (p * 1_000..(p + 1) * 1_000).collect::<Vec<_>>());
    }
}
