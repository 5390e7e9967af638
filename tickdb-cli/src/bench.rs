//! Append throughput harness

use std::time::{Duration, Instant};
use tickdb_core::{Engine, Record, Result};

/// Outcome of one benchmark run
#[derive(Debug)]
pub struct BenchReport {
    /// Appends accepted by the engine
    pub appended: usize,
    /// Wall-clock time including the final synchronous flush
    pub elapsed: Duration,
}

impl BenchReport {
    /// Accepted appends per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return self.appended as f64;
        }
        self.appended as f64 / secs
    }
}

/// Append `count` strictly increasing records, flush, and time the run.
///
/// Timestamps continue from the engine's current watermark so the run
/// composes with existing data.
pub fn run_append_bench(engine: &Engine, count: usize) -> Result<BenchReport> {
    let base = engine.last_timestamp().max(0) + 1;
    let timer = Instant::now();
    let mut appended = 0;
    for i in 0..count {
        if engine.append(Record::new(base + i as i64, i as f64)) {
            appended += 1;
        }
    }
    engine.flush()?;
    Ok(BenchReport {
        appended,
        elapsed: timer.elapsed(),
    })
}
