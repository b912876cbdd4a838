//! Stress runs for NestDB.
//!
//! These drive a store from many tasks at once to shake out races between
//! loads, writers and the per-document locks.

use nestdb_codec::Value;
use nestdb_core::{Store, UpdateOptions};
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent tasks.
    pub tasks: usize,
    /// Number of distinct documents.
    pub document_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            tasks: 4,
            document_count: 1_000,
        }
    }
}

fn counter_doc(id: usize) -> Value {
    vec![
        ("_id", Value::Integer(id as i64)),
        ("n", Value::Integer(0)),
        ("bucket", Value::Integer((id % 10) as i64)),
    ]
    .into_iter()
    .collect()
}

fn by_id(id: usize) -> Value {
    vec![("_id", Value::Integer(id as i64))].into_iter().collect()
}

fn increment() -> Value {
    let inc: Value = vec![("n", Value::Integer(1))].into_iter().collect();
    vec![("$inc", inc)].into_iter().collect()
}

fn tally(results: Vec<Result<(usize, usize), tokio::task::JoinError>>) -> (usize, usize) {
    results.into_iter().fold((0, 0), |(ok, failed), r| match r {
        Ok((o, f)) => (ok + o, failed + f),
        Err(_) => (ok, failed + 1),
    })
}

/// Inserts `operations` documents one at a time.
pub async fn stress_sequential_inserts(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match store.insert(counter_doc(i)).await {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Seeds `document_count` counters, then has `tasks` tasks increment them
/// round-robin. Afterwards the counters sum to the number of successful
/// increments.
pub async fn stress_concurrent_increments(store: &Store, config: &StressConfig) -> StressTestResult {
    let seed = (0..config.document_count).map(counter_doc).collect();
    if store.insert_many(seed).await.is_err() {
        return StressTestResult::new(0, config.operations, Duration::ZERO);
    }

    let start = Instant::now();
    let per_task = config.operations / config.tasks.max(1);
    let handles: Vec<_> = (0..config.tasks)
        .map(|t| {
            let store = store.clone();
            let count = config.document_count.max(1);
            tokio::spawn(async move {
                let (mut ok, mut failed) = (0usize, 0usize);
                for i in 0..per_task {
                    let target = by_id((t + i) % count);
                    match store.update(&target, &increment(), UpdateOptions::new()).await {
                        Ok(r) if r.count == 1 => ok += 1,
                        _ => failed += 1,
                    }
                }
                (ok, failed)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await);
    }
    let (successful, failed) = tally(results);
    StressTestResult::new(successful, failed, start.elapsed())
}

/// Mixes inserts, multi-document updates, finds and removes across tasks.
/// Failures are expected only from id collisions between tasks.
pub async fn stress_mixed_operations(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let per_task = config.operations / config.tasks.max(1);
    let handles: Vec<_> = (0..config.tasks)
        .map(|t| {
            let store = store.clone();
            let count = config.document_count.max(1);
            tokio::spawn(async move {
                let (mut ok, mut failed) = (0usize, 0usize);
                for i in 0..per_task {
                    let id = (t * per_task + i) % count;
                    let bucket: Value =
                        vec![("bucket", Value::Integer((id % 10) as i64))].into_iter().collect();
                    let result = match i % 4 {
                        0 => store.insert(counter_doc(id)).await.map(|_| ()),
                        1 => store
                            .update(&bucket, &increment(), UpdateOptions::new().multi(true))
                            .await
                            .map(|_| ()),
                        2 => store.find(&bucket).await.map(|_| ()),
                        _ => store
                            .remove(&by_id(id), nestdb_core::RemoveOptions::one())
                            .await
                            .map(|_| ()),
                    };
                    match result {
                        Ok(()) => ok += 1,
                        Err(_) => failed += 1,
                    }
                }
                (ok, failed)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await);
    }
    let (successful, failed) = tally(results);
    StressTestResult::new(successful, failed, start.elapsed())
}
