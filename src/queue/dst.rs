//! Queue Deterministic Simulation Testing Harness
//!
//! Drives producer, queue and consumer together under fault injection:
//!
//! - **Order**: the remote sees final outcomes in version order
//! - **Monotonic acks**: the acknowledged version never moves backwards
//! - **No redelivery**: an acknowledged version is never submitted again,
//!   across consumer replacement and process crash
//! - **Completeness**: every put that returned `Ok` is applied or rejected
//!
//! ## DST Methodology
//!
//! 1. SimulatedSegmentStore (disk faults) + SimulatedRemote (backend faults)
//! 2. Put operations while a real consumer drains them on a single-threaded
//!    runtime; randomly replace the consumer (`process.consumer_crash`)
//! 3. Optionally crash the process mid-run: stop the consumer, drop unsynced
//!    bytes without running `Drop`, reopen the queue and attach a fresh
//!    consumer. Puts that were neither synced nor acknowledged are lost and
//!    leave the accepted set.
//! 4. Drain to completion and check the invariants against the remote log
//!
//! Fault decisions come from seeded `SimulatedRng`s; wall-clock timers in the
//! consumer mean interleavings can differ between runs of the same seed, the
//! invariants may not.

use crate::buggify::faults::{process, remote as remote_faults};
use crate::buggify::{self, FaultConfig};
use crate::config::{ConsumerConfig, FsyncPolicy, QueueConfig};
use crate::io::simulation::SimulatedRng;
use crate::io::Rng;
use crate::queue::consumer::{spawn_consumer, ConsumerHandle, RemoteSink, SubmitOutcome};
use crate::queue::disk_queue::OperationQueue;
use crate::queue::operation::{parse_path, ContainerType, Operation, QueuedOperation};
use crate::queue::reconcile::SyncBackend;
use crate::queue::store::{SimulatedSegmentStore, SimulatedStoreConfig, SimulatedStoreStats};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// SimulatedRemote - backend with buggify fault injection
// ============================================================================

#[derive(Debug, Clone)]
pub struct RemoteFaultConfig {
    pub unavailable_prob: f64,
    pub reject_prob: f64,
    pub slow_submit_prob: f64,
}

impl Default for RemoteFaultConfig {
    fn default() -> Self {
        RemoteFaultConfig {
            unavailable_prob: 0.05,
            reject_prob: 0.01,
            slow_submit_prob: 0.05,
        }
    }
}

impl RemoteFaultConfig {
    pub fn no_faults() -> Self {
        RemoteFaultConfig {
            unavailable_prob: 0.0,
            reject_prob: 0.0,
            slow_submit_prob: 0.0,
        }
    }

    pub fn high_chaos() -> Self {
        RemoteFaultConfig {
            unavailable_prob: 0.25,
            reject_prob: 0.05,
            slow_submit_prob: 0.2,
        }
    }
}

#[derive(Debug, Default)]
struct RemoteLog {
    /// Final outcomes in arrival order: (version, applied)
    outcomes: Vec<(u64, bool)>,
    submissions: u64,
    /// Submissions of versions that were already acknowledged
    redelivered_acked: Vec<u64>,
}

/// In-memory backend that applies operations and can fail like a real one
pub struct SimulatedRemote {
    rng: Mutex<SimulatedRng>,
    config: RemoteFaultConfig,
    log: Mutex<RemoteLog>,
    acks: Mutex<Option<watch::Receiver<u64>>>,
}

impl SimulatedRemote {
    pub fn new(rng: SimulatedRng, config: RemoteFaultConfig) -> Self {
        SimulatedRemote {
            rng: Mutex::new(rng),
            config,
            log: Mutex::new(RemoteLog::default()),
            acks: Mutex::new(None),
        }
    }

    /// Never fails
    pub fn reliable() -> Self {
        SimulatedRemote::new(SimulatedRng::new(0), RemoteFaultConfig::no_faults())
    }

    /// Flag submissions at or below the queue's acknowledged version
    pub fn watch_acks(&self, acks: watch::Receiver<u64>) {
        *self.acks.lock() = Some(acks);
    }

    /// Versions applied, in order
    pub fn applied(&self) -> Vec<u64> {
        self.log
            .lock()
            .outcomes
            .iter()
            .filter(|(_, applied)| *applied)
            .map(|(v, _)| *v)
            .collect()
    }

    /// Versions rejected as fatal, in order
    pub fn rejected(&self) -> Vec<u64> {
        self.log
            .lock()
            .outcomes
            .iter()
            .filter(|(_, applied)| !*applied)
            .map(|(v, _)| *v)
            .collect()
    }

    pub fn submissions(&self) -> u64 {
        self.log.lock().submissions
    }

    fn outcomes(&self) -> Vec<(u64, bool)> {
        self.log.lock().outcomes.clone()
    }

    fn redelivered_acked(&self) -> Vec<u64> {
        self.log.lock().redelivered_acked.clone()
    }

    fn decide(&self, version: u64) -> (SubmitOutcome, bool) {
        let mut rng = self.rng.lock();
        let rng = &mut *rng;
        let slow = crate::buggify!(rng, remote_faults::SLOW_SUBMIT, self.config.slow_submit_prob);

        if crate::buggify!(rng, remote_faults::UNAVAILABLE, self.config.unavailable_prob) {
            return (SubmitOutcome::Retryable("simulated outage".to_string()), slow);
        }
        if crate::buggify!(rng, remote_faults::REJECT, self.config.reject_prob) {
            return (
                SubmitOutcome::Fatal(format!("simulated rejection of version {}", version)),
                slow,
            );
        }
        (SubmitOutcome::Acked, slow)
    }
}

impl RemoteSink for SimulatedRemote {
    fn submit<'a>(
        &'a self,
        op: &'a QueuedOperation,
    ) -> Pin<Box<dyn Future<Output = SubmitOutcome> + Send + 'a>> {
        Box::pin(async move {
            let acked = self.acks.lock().as_ref().map(|rx| *rx.borrow());
            let (outcome, slow) = self.decide(op.version);
            if slow {
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
            }

            let mut log = self.log.lock();
            log.submissions += 1;
            if acked.is_some_and(|acked| op.version <= acked) {
                log.redelivered_acked.push(op.version);
            }
            match &outcome {
                SubmitOutcome::Acked => log.outcomes.push((op.version, true)),
                SubmitOutcome::Fatal(_) => log.outcomes.push((op.version, false)),
                SubmitOutcome::Retryable(_) => {}
            }
            outcome
        })
    }
}

/// Backend holding one `SimulatedRemote` per container
pub struct SimulatedBackend {
    config: RemoteFaultConfig,
    seed: u64,
    remotes: Mutex<HashMap<String, Arc<SimulatedRemote>>>,
    registered: Mutex<Vec<(ContainerType, String)>>,
}

impl SimulatedBackend {
    pub fn new(seed: u64, config: RemoteFaultConfig) -> Self {
        SimulatedBackend {
            config,
            seed,
            remotes: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
        }
    }

    pub fn reliable() -> Self {
        SimulatedBackend::new(0, RemoteFaultConfig::no_faults())
    }

    /// Remote for a container, created on first use
    pub fn remote(&self, container_id: &str) -> Arc<SimulatedRemote> {
        let mut remotes = self.remotes.lock();
        let seed = self.seed.wrapping_add(remotes.len() as u64);
        Arc::clone(remotes.entry(container_id.to_string()).or_insert_with(|| {
            Arc::new(SimulatedRemote::new(
                SimulatedRng::new(seed),
                self.config.clone(),
            ))
        }))
    }

    /// `(container type, project)` of every offline registration
    pub fn registrations(&self) -> Vec<(ContainerType, String)> {
        self.registered.lock().clone()
    }
}

impl SyncBackend for SimulatedBackend {
    fn sink_for<'a>(
        &'a self,
        _container_type: ContainerType,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RemoteSink>, String>> + Send + 'a>> {
        Box::pin(async move { Ok(self.remote(container_id) as Arc<dyn RemoteSink>) })
    }

    fn register_offline<'a>(
        &'a self,
        container_type: ContainerType,
        project: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            let mut registered = self.registered.lock();
            registered.push((container_type, project.to_string()));
            Ok(format!("{}-{}", container_type.as_str().to_uppercase(), registered.len()))
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Result of a single DST run
#[derive(Debug)]
pub struct QueueDSTResult {
    pub seed: u64,
    pub total_ops: usize,
    pub accepted_ops: usize,
    pub failed_puts: usize,
    pub applied: usize,
    pub rejected: usize,
    pub submissions: u64,
    pub consumer_restarts: usize,
    pub process_crashes: usize,
    /// Accepted puts that were not yet durable when the process crashed
    pub lost_ops: usize,
    pub store_stats: SimulatedStoreStats,
    /// Injected faults that fired, across disk, remote and process sites
    pub fault_triggers: u64,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the queue DST harness
#[derive(Debug, Clone)]
pub struct QueueDSTConfig {
    pub num_ops: usize,
    /// Small to force rotation and segment deletion
    pub max_segment_size: u64,
    pub store_config: SimulatedStoreConfig,
    pub remote_config: RemoteFaultConfig,
    /// Probability of replacing the consumer after each put
    pub consumer_crash_prob: f64,
    /// Crash and reopen the queue once, at a random point
    pub simulate_crash: bool,
    pub fsync_policy: FsyncPolicy,
    pub fsync_interval: Duration,
}

impl Default for QueueDSTConfig {
    fn default() -> Self {
        QueueDSTConfig {
            num_ops: 100,
            max_segment_size: 512,
            store_config: SimulatedStoreConfig::default(),
            remote_config: RemoteFaultConfig::default(),
            consumer_crash_prob: 0.05,
            simulate_crash: true,
            fsync_policy: FsyncPolicy::Always,
            fsync_interval: Duration::from_millis(10),
        }
    }
}

impl QueueDSTConfig {
    /// No faults, no crash
    pub fn baseline() -> Self {
        QueueDSTConfig {
            store_config: SimulatedStoreConfig::no_faults(),
            remote_config: RemoteFaultConfig::no_faults(),
            consumer_crash_prob: 0.0,
            simulate_crash: false,
            ..Default::default()
        }
    }

    /// Consumer replacement and a process crash, no I/O faults
    pub fn crash_only() -> Self {
        QueueDSTConfig {
            store_config: SimulatedStoreConfig::no_faults(),
            remote_config: RemoteFaultConfig::no_faults(),
            consumer_crash_prob: 0.1,
            simulate_crash: true,
            ..Default::default()
        }
    }

    /// Periodic fsync that never comes due, so only rotation syncs and the
    /// crash loses the unsynced tail
    pub fn every_second() -> Self {
        QueueDSTConfig {
            store_config: SimulatedStoreConfig::no_faults(),
            remote_config: RemoteFaultConfig::no_faults(),
            consumer_crash_prob: 0.0,
            simulate_crash: true,
            fsync_policy: FsyncPolicy::EverySecond,
            fsync_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Everything at once
    pub fn chaos() -> Self {
        QueueDSTConfig {
            store_config: SimulatedStoreConfig::high_chaos(),
            remote_config: RemoteFaultConfig::high_chaos(),
            consumer_crash_prob: 0.1,
            simulate_crash: true,
            ..Default::default()
        }
    }
}

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const REOPEN_ATTEMPTS: usize = 20;

type SimQueue = OperationQueue<SimulatedSegmentStore<SimulatedRng>>;

#[derive(Debug, Default)]
struct RunCounts {
    accepted_ops: usize,
    failed_puts: usize,
    consumer_restarts: usize,
    process_crashes: usize,
    lost_ops: usize,
}

/// Queue DST Harness
pub struct QueueDSTHarness {
    seed: u64,
    rng: SimulatedRng,
    config: QueueDSTConfig,
    violations: Vec<String>,
    last_ack_seen: u64,
}

impl QueueDSTHarness {
    pub fn new(seed: u64, config: QueueDSTConfig) -> Self {
        QueueDSTHarness {
            seed,
            rng: SimulatedRng::new(seed),
            config,
            violations: Vec::new(),
            last_ack_seen: 0,
        }
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> QueueDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                return QueueDSTResult {
                    seed: self.seed,
                    total_ops: self.config.num_ops,
                    accepted_ops: 0,
                    failed_puts: 0,
                    applied: 0,
                    rejected: 0,
                    submissions: 0,
                    consumer_restarts: 0,
                    process_crashes: 0,
                    lost_ops: 0,
                    store_stats: SimulatedStoreStats::default(),
                    fault_triggers: 0,
                    passed: false,
                    error_message: Some(format!("Failed to build runtime: {}", e)),
                }
            }
        };
        // Consumer crashes come from the fault table; disk and remote sites
        // pass their own probabilities.
        buggify::set_config(
            FaultConfig::new().with(process::CONSUMER_CRASH, self.config.consumer_crash_prob),
        );
        buggify::reset_stats();
        runtime.block_on(self.run_scenario())
    }

    async fn run_scenario(&mut self) -> QueueDSTResult {
        let store = SimulatedSegmentStore::new(
            self.rng.fork(),
            self.config.store_config.clone(),
        );
        let remote = Arc::new(SimulatedRemote::new(
            self.rng.fork(),
            self.config.remote_config.clone(),
        ));
        let queue_config = QueueConfig {
            fsync_policy: self.config.fsync_policy,
            max_segment_size: self.config.max_segment_size,
            fsync_interval: self.config.fsync_interval,
        };
        let mut counts = RunCounts::default();

        let mut queue = match self.reopen(&store, &queue_config) {
            Ok(q) => q,
            Err(e) => return self.result(&store, &remote, &counts, Some(e)),
        };
        remote.watch_acks(queue.subscribe_acks());
        let mut consumer = Some(self.attach(&queue, &remote));

        let mut accepted: Vec<u64> = Vec::new();

        let crash_at = if self.config.simulate_crash {
            self.rng
                .gen_range(1, (self.config.num_ops as u64).saturating_add(1)) as usize
        } else {
            usize::MAX
        };

        // Phase 1: produce while the consumer drains
        for i in 0..self.config.num_ops {
            if i == crash_at {
                if let Some(c) = consumer.take() {
                    self.detach(c).await;
                }
                // Delivered versions are all acknowledged once the consumer
                // has stopped, so nothing above this reached the remote
                let survived = queue.synced_version().max(queue.last_acked_version());
                let before = accepted.len();
                accepted.retain(|&v| v <= survived);
                counts.lost_ops += before - accepted.len();

                // Process dies without running Drop
                std::mem::forget(queue);
                store.inner_store().simulate_crash();
                counts.process_crashes += 1;

                queue = match self.reopen(&store, &queue_config) {
                    Ok(q) => q,
                    Err(e) => {
                        counts.accepted_ops = accepted.len();
                        return self.result(&store, &remote, &counts, Some(e));
                    }
                };
                if queue.last_put_version() < survived {
                    self.violations.push(format!(
                        "Reopened at put {} below durable version {}",
                        queue.last_put_version(),
                        survived
                    ));
                }
                remote.watch_acks(queue.subscribe_acks());
                consumer = Some(self.attach(&queue, &remote));
            }

            match queue.put(make_op(i)) {
                Ok(version) => accepted.push(version),
                Err(_) => counts.failed_puts += 1,
            }
            self.observe_ack(&queue);

            let replace = crate::buggify!(&mut self.rng, process::CONSUMER_CRASH)
                || consumer.as_ref().map_or(true, ConsumerHandle::is_finished);
            if replace {
                if let Some(c) = consumer.take() {
                    self.detach(c).await;
                }
                consumer = Some(self.attach(&queue, &remote));
                counts.consumer_restarts += 1;
            }

            for _ in 0..self.rng.gen_range(0, 4) {
                tokio::task::yield_now().await;
            }
        }

        // Phase 2: drain everything that was put
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while queue.last_acked_version() < queue.last_put_version() {
            if tokio::time::Instant::now() >= deadline {
                self.violations.push(format!(
                    "Drain timed out at ack {} of put {}",
                    queue.last_acked_version(),
                    queue.last_put_version()
                ));
                break;
            }
            if consumer.as_ref().map_or(true, ConsumerHandle::is_finished) {
                if let Some(c) = consumer.take() {
                    self.detach(c).await;
                }
                consumer = Some(self.attach(&queue, &remote));
                counts.consumer_restarts += 1;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.observe_ack(&queue);
        }
        if let Some(c) = consumer.take() {
            self.detach(c).await;
        }

        // Phase 3: verify
        self.verify_remote(&remote, &accepted);
        queue.verify_invariants();

        counts.accepted_ops = accepted.len();
        self.result(&store, &remote, &counts, None)
    }

    /// Open the queue, retrying injected metadata write failures
    fn reopen(
        &self,
        store: &SimulatedSegmentStore<SimulatedRng>,
        config: &QueueConfig,
    ) -> Result<SimQueue, String> {
        let mut last_error = String::new();
        for _ in 0..REOPEN_ATTEMPTS {
            match OperationQueue::open(store.clone(), config.clone()) {
                Ok(q) => return Ok(q),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(format!("Reopen failed: {}", last_error))
    }

    fn attach(&self, queue: &SimQueue, remote: &Arc<SimulatedRemote>) -> ConsumerHandle {
        spawn_consumer(
            queue.clone(),
            Arc::clone(remote) as Arc<dyn RemoteSink>,
            ConsumerConfig::test(),
        )
    }

    async fn detach(&mut self, consumer: ConsumerHandle) {
        if !consumer.stop(STOP_TIMEOUT).await {
            self.violations
                .push("Consumer did not stop within timeout".to_string());
        }
    }

    fn observe_ack(&mut self, queue: &SimQueue) {
        let ack = queue.last_acked_version();
        if ack < self.last_ack_seen {
            self.violations.push(format!(
                "Acknowledged version moved backwards: {} -> {}",
                self.last_ack_seen, ack
            ));
        }
        self.last_ack_seen = ack;
    }

    fn verify_remote(&mut self, remote: &SimulatedRemote, accepted: &[u64]) {
        let outcomes = remote.outcomes();

        // Order: strictly increasing, except an unacknowledged op delivered
        // again right after itself
        for pair in outcomes.windows(2) {
            let (prev, next) = (pair[0].0, pair[1].0);
            if next < prev {
                self.violations.push(format!(
                    "Out of order delivery: {} after {}",
                    next, prev
                ));
                break;
            }
        }

        let redelivered = remote.redelivered_acked();
        if !redelivered.is_empty() {
            self.violations.push(format!(
                "Acknowledged versions submitted again: {:?}",
                &redelivered[..redelivered.len().min(10)]
            ));
        }

        let seen: std::collections::HashSet<u64> = outcomes.iter().map(|(v, _)| *v).collect();
        let missing: Vec<u64> = accepted
            .iter()
            .copied()
            .filter(|v| !seen.contains(v))
            .collect();
        if !missing.is_empty() {
            self.violations.push(format!(
                "INVARIANT VIOLATION: {} accepted operations never delivered (first 10): {:?}",
                missing.len(),
                &missing[..missing.len().min(10)]
            ));
        }
    }

    fn result(
        &self,
        store: &SimulatedSegmentStore<SimulatedRng>,
        remote: &SimulatedRemote,
        counts: &RunCounts,
        fatal: Option<String>,
    ) -> QueueDSTResult {
        let mut messages = self.violations.clone();
        if let Some(fatal) = fatal {
            messages.push(fatal);
        }
        let passed = messages.is_empty();
        QueueDSTResult {
            seed: self.seed,
            total_ops: self.config.num_ops,
            accepted_ops: counts.accepted_ops,
            failed_puts: counts.failed_puts,
            applied: remote.applied().len(),
            rejected: remote.rejected().len(),
            submissions: remote.submissions(),
            consumer_restarts: counts.consumer_restarts,
            process_crashes: counts.process_crashes,
            lost_ops: counts.lost_ops,
            store_stats: store.stats(),
            fault_triggers: buggify::stats().total_triggers(),
            passed,
            error_message: if passed { None } else { Some(messages.join("; ")) },
        }
    }
}

fn make_op(i: usize) -> Operation {
    match i % 3 {
        0 => Operation::AssignInt {
            path: parse_path("sys/step"),
            value: i as i64,
        },
        1 => Operation::AssignString {
            path: parse_path(&format!("params/key-{}", i % 7)),
            value: format!("value-{}", i),
        },
        _ => Operation::AddStrings {
            path: parse_path("sys/tags"),
            values: vec![format!("tag-{}", i)],
        },
    }
}

/// Run a batch of DST tests across multiple seeds
pub fn run_queue_dst_batch(seeds: std::ops::Range<u64>, config: QueueDSTConfig) -> Vec<QueueDSTResult> {
    seeds
        .map(|seed| {
            let mut harness = QueueDSTHarness::new(seed, config.clone());
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_queue_dst_batch(results: &[QueueDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let accepted: usize = results.iter().map(|r| r.accepted_ops).sum();
    let applied: usize = results.iter().map(|r| r.applied).sum();
    let rejected: usize = results.iter().map(|r| r.rejected).sum();
    let restarts: usize = results.iter().map(|r| r.consumer_restarts).sum();
    let crashes: usize = results.iter().map(|r| r.process_crashes).sum();
    let lost: usize = results.iter().map(|r| r.lost_ops).sum();
    let faults: u64 = results.iter().map(|r| r.fault_triggers).sum();

    let mut summary = format!(
        "Queue DST Batch: {}/{} passed ({} failed)\n\
         Accepted: {}, Applied: {}, Rejected: {}, Consumer restarts: {}, Crashes: {}, Lost in crash: {}, Faults fired: {}",
        passed, total, failed, accepted, applied, rejected, restarts, crashes, lost, faults
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}
