//! Queue DST Integration Tests
//!
//! Multi-seed simulation of producer, queue, consumer and backend with disk
//! faults, backend faults, consumer replacement and process crashes.

use opsync::queue::store::SimulatedStoreConfig;
use opsync::queue::{
    run_queue_dst_batch, summarize_queue_dst_batch, QueueDSTConfig, RemoteFaultConfig,
};

fn assert_all_passed(results: &[opsync::queue::QueueDSTResult]) {
    for r in results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
    }
}

#[test]
fn test_queue_dst_20_seeds_crash_and_replacement() {
    // INVARIANT: every accepted put is delivered, in order, and nothing
    // acknowledged is submitted again after the consumer is replaced.
    let config = QueueDSTConfig::crash_only();
    let results = run_queue_dst_batch(0..20, config);
    let summary = summarize_queue_dst_batch(&results);

    assert_all_passed(&results);
    for r in &results {
        assert_eq!(r.failed_puts, 0, "Seed {}: no disk faults configured", r.seed);
        assert_eq!(r.applied, r.accepted_ops);
    }
    println!("{}", summary);
}

#[test]
fn test_queue_dst_20_seeds_every_second_crash() {
    // Puts that were neither synced nor acknowledged may vanish in the
    // crash; everything else is delivered and the queue keeps moving.
    let config = QueueDSTConfig::every_second();
    let results = run_queue_dst_batch(0..20, config);
    let summary = summarize_queue_dst_batch(&results);

    assert_all_passed(&results);
    for r in &results {
        assert_eq!(r.process_crashes, 1);
        assert_eq!(r.failed_puts, 0);
        assert_eq!(r.applied, r.accepted_ops);
        assert_eq!(r.accepted_ops + r.lost_ops, r.total_ops);
    }
    println!("{}", summary);
}

#[test]
fn test_queue_dst_20_seeds_remote_faults() {
    // Retryable outages are retried; fatal rejections are skipped but
    // still count as delivered outcomes.
    let config = QueueDSTConfig {
        store_config: SimulatedStoreConfig::no_faults(),
        remote_config: RemoteFaultConfig::high_chaos(),
        consumer_crash_prob: 0.0,
        simulate_crash: false,
        ..Default::default()
    };
    let results = run_queue_dst_batch(0..20, config);
    let summary = summarize_queue_dst_batch(&results);

    assert_all_passed(&results);
    let total_rejected: usize = results.iter().map(|r| r.rejected).sum();
    assert!(total_rejected > 0, "high chaos should reject something");
    for r in &results {
        assert_eq!(r.applied + r.rejected, r.accepted_ops);
        assert!(r.submissions >= r.accepted_ops as u64);
    }
    println!("{}", summary);
}

#[test]
fn test_queue_dst_20_seeds_disk_faults() {
    // Failed puts are not accepted and need not be delivered; accepted ones
    // must survive the crash.
    let config = QueueDSTConfig {
        store_config: SimulatedStoreConfig::high_chaos(),
        remote_config: RemoteFaultConfig::no_faults(),
        ..Default::default()
    };
    let results = run_queue_dst_batch(0..20, config);
    let summary = summarize_queue_dst_batch(&results);

    assert_all_passed(&results);
    println!("{}", summary);
}

#[test]
fn test_queue_dst_10_seeds_full_chaos() {
    let results = run_queue_dst_batch(0..10, QueueDSTConfig::chaos());
    let summary = summarize_queue_dst_batch(&results);

    assert_all_passed(&results);
    assert!(summary.contains("10/10 passed"));
    println!("{}", summary);
}

#[test]
fn test_queue_dst_small_segments() {
    // Many rotations and deletions of acknowledged segments
    let config = QueueDSTConfig {
        num_ops: 200,
        max_segment_size: 128,
        ..QueueDSTConfig::crash_only()
    };
    let results = run_queue_dst_batch(100..110, config);
    assert_all_passed(&results);
}
