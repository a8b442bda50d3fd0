//! Benchmark harness
//!
//! Runs one bound strategy against a fixed source frame, timing every call
//! to `apply`, presenting the canvas between iterations and stopping early
//! when cancellation is requested.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::apply::{Method, Remapper};
use crate::canvas::Canvas;

/// Something that shows the destination canvas
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    fn present(&mut self, canvas: &Canvas) -> Result<()>;
}

/// Timings collected by one benchmark run
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub method: Method,
    pub samples: Vec<Duration>,
    /// Whether the run stopped before `repeat` iterations
    pub cancelled: bool,
}

impl BenchReport {
    pub fn iterations(&self) -> usize {
        self.samples.len()
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Log a one-line summary of the run
    pub fn log_summary(&self) {
        match (self.min(), self.mean(), self.max()) {
            (Some(min), Some(mean), Some(max)) => info!(
                "{}: {} iterations{}, min {} us, mean {} us, max {} us",
                self.method,
                self.iterations(),
                if self.cancelled { " (cancelled)" } else { "" },
                min.as_micros(),
                mean.as_micros(),
                max.as_micros()
            ),
            _ => info!("{}: no iterations ran", self.method),
        }
    }
}

/// Repeatedly applies a strategy and records how long each call takes
pub struct Benchmark {
    repeat: u32,
    sinks: Vec<Box<dyn FrameSink>>,
    stop: Arc<AtomicBool>,
}

impl Benchmark {
    pub fn new(repeat: u32, stop: Arc<AtomicBool>) -> Self {
        Self {
            repeat,
            sinks: Vec::new(),
            stop,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run up to `repeat` iterations of `remapper.apply(source)`
    ///
    /// Cancellation is only observed between iterations, never inside a call.
    pub fn run(&mut self, remapper: &Remapper<'_>, canvas: &Canvas, source: &[u32]) -> BenchReport {
        info!(
            "Remap method: {} over {} entries ({} worker{}, {} entries per chunk, block kernel: {})",
            remapper.method(),
            remapper.len(),
            remapper.workers(),
            if remapper.workers() == 1 { "" } else { "s" },
            remapper.chunk_len(),
            remapper.block_isa().map_or("none", |isa| isa.name())
        );

        let mut samples = Vec::with_capacity(self.repeat as usize);
        let mut cancelled = false;

        for _ in 0..self.repeat {
            if self.stop.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            let start = Instant::now();
            remapper.apply(source);
            let elapsed = start.elapsed();

            info!(
                "Operations took {} ms, {} us",
                elapsed.as_millis(),
                elapsed.as_micros()
            );
            samples.push(elapsed);

            for sink in self.sinks.iter_mut() {
                if let Err(e) = sink.present(canvas) {
                    warn!("Failed to present frame to {}: {}", sink.name(), e);
                }
            }
        }

        BenchReport {
            method: remapper.method(),
            samples,
            cancelled,
        }
    }
}
