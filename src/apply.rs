//! Remap table application strategies
//!
//! A [`Remapper`] binds a [`RemapTable`] to one [`Canvas`] and copies each
//! source word `source[i]` into the destination slot for entry `i`. All
//! strategies have the same observable effect and differ only in how the
//! work is executed:
//!
//! - `sequential`: one thread, increasing index order
//! - `parallel`: contiguous chunks, one per hardware thread, fork-join
//! - `block-transfer`: four entries per step with a vector load (NEON/SSE4.1)
//! - `parallel-block-transfer`: both of the above
//!
//! # Colliding destinations
//!
//! When two entries point at the same destination, the sequential strategies
//! leave the word of the higher index. The parallel ones leave whichever
//! worker's store lands last. That race is accepted: it only changes which
//! of the colliding source pixels is visible. It must not be serialized with
//! locks. Destination words are atomics written with `Relaxed` ordering so the
//! race is well defined and costs nothing over a plain store.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use crate::canvas::Canvas;
use crate::remap::{RemapError, RemapTable};

/// Entries moved per block-transfer step
pub const BLOCK: usize = 4;

/// Strategy identifier, selected once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Plain loop over the table
    #[value(alias = "plain")]
    Sequential,
    /// Multi-threaded; each worker applies the table to its own sub-range
    Parallel,
    /// Four entries per step using a 128-bit vector load
    #[value(alias = "plain-o1")]
    BlockTransfer,
    /// Multi-threaded block transfer
    #[value(alias = "parallel-o1")]
    ParallelBlockTransfer,
}

impl Method {
    pub const ALL: [Method; 4] = [
        Method::Sequential,
        Method::Parallel,
        Method::BlockTransfer,
        Method::ParallelBlockTransfer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Method::Sequential => "sequential",
            Method::Parallel => "parallel",
            Method::BlockTransfer => "block-transfer",
            Method::ParallelBlockTransfer => "parallel-block-transfer",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Method::Sequential => "plain 1D table with a for-loop",
            Method::Parallel => "multi-threaded loop; each thread applies the table to its sub-range",
            Method::BlockTransfer => "four entries per step with vector loads",
            Method::ParallelBlockTransfer => "multi-threaded block transfer",
        }
    }

    pub fn uses_blocks(&self) -> bool {
        matches!(self, Method::BlockTransfer | Method::ParallelBlockTransfer)
    }

    /// Whether this method can run on the current machine
    pub fn is_available(&self) -> bool {
        !self.uses_blocks() || BlockIsa::detect().is_some()
    }

    /// Reject methods that need an instruction set this machine lacks
    pub fn ensure_available(&self) -> Result<(), RemapError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemapError::Unsupported(self.name()))
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Instruction set used for the four-wide block kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIsa {
    #[cfg(target_arch = "aarch64")]
    Neon,
    #[cfg(target_arch = "x86_64")]
    Sse41,
}

impl BlockIsa {
    /// Runtime detection; `None` on platforms without a block kernel
    pub fn detect() -> Option<Self> {
        #[cfg(target_arch = "aarch64")]
        {
            if std::arch::is_aarch64_feature_detected!("neon") {
                return Some(BlockIsa::Neon);
            }
        }
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("sse4.1") {
                return Some(BlockIsa::Sse41);
            }
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match *self {
            #[cfg(target_arch = "aarch64")]
            BlockIsa::Neon => "NEON",
            #[cfg(target_arch = "x86_64")]
            BlockIsa::Sse41 => "SSE4.1",
        }
    }
}

/// Platform-reported number of hardware threads
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

enum Execution {
    Sequential,
    Parallel {
        pool: ThreadPool,
        chunk: usize,
    },
    BlockTransfer {
        isa: BlockIsa,
    },
    ParallelBlockTransfer {
        pool: ThreadPool,
        chunk: usize,
        isa: BlockIsa,
    },
}

/// A remap table bound to a destination canvas
///
/// Table offsets are resolved to destination slot references once, here,
/// after validating that every offset lies inside the canvas. `apply` then
/// runs without per-pixel bounds checks. The canvas borrow guarantees the
/// destination outlives the strategy.
pub struct Remapper<'c> {
    method: Method,
    slots: Box<[&'c AtomicU32]>,
    execution: Execution,
}

impl<'c> Remapper<'c> {
    pub fn new(method: Method, table: &RemapTable, canvas: &'c Canvas) -> Result<Self, RemapError> {
        if table.len() != canvas.len() {
            return Err(RemapError::SizeMismatch {
                table: table.len(),
                canvas: canvas.len(),
            });
        }
        if table.out_of_bounds() > 0 {
            return Err(RemapError::OutOfBounds {
                count: table.out_of_bounds(),
            });
        }

        let execution = match method {
            Method::Sequential => Execution::Sequential,
            Method::Parallel => {
                let pool = worker_pool()?;
                let chunk = chunk_len(table.len(), pool.current_num_threads(), 1);
                Execution::Parallel { pool, chunk }
            }
            Method::BlockTransfer => Execution::BlockTransfer {
                isa: block_isa(method, table.len())?,
            },
            Method::ParallelBlockTransfer => {
                let isa = block_isa(method, table.len())?;
                let pool = worker_pool()?;
                let chunk = chunk_len(table.len(), pool.current_num_threads(), BLOCK);
                Execution::ParallelBlockTransfer { pool, chunk, isa }
            }
        };

        let pixels = canvas.pixels();
        let slots = table
            .offsets()
            .iter()
            .map(|&offset| pixels.get(offset))
            .collect::<Option<Box<[_]>>>()
            .ok_or(RemapError::OutOfBounds { count: 1 })?;

        debug!(
            "Bound {} table ({} entries) to canvas {} ({})",
            table.resolution(),
            slots.len(),
            canvas.resolution(),
            method
        );

        Ok(Self {
            method,
            slots,
            execution,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Worker threads used per call (1 for the single-threaded strategies)
    pub fn workers(&self) -> usize {
        match &self.execution {
            Execution::Sequential | Execution::BlockTransfer { .. } => 1,
            Execution::Parallel { pool, .. } | Execution::ParallelBlockTransfer { pool, .. } => {
                pool.current_num_threads()
            }
        }
    }

    /// Entries handled by one worker (the whole table when single-threaded)
    pub fn chunk_len(&self) -> usize {
        match &self.execution {
            Execution::Sequential | Execution::BlockTransfer { .. } => self.slots.len(),
            Execution::Parallel { chunk, .. } | Execution::ParallelBlockTransfer { chunk, .. } => {
                *chunk
            }
        }
    }

    /// Instruction set of the block kernel, if this strategy uses one
    pub fn block_isa(&self) -> Option<BlockIsa> {
        match &self.execution {
            Execution::BlockTransfer { isa } | Execution::ParallelBlockTransfer { isa, .. } => {
                Some(*isa)
            }
            _ => None,
        }
    }

    /// Write `source[i]` to the destination of entry `i` for every entry
    ///
    /// Blocks until all workers are done. `source` must hold one word per
    /// table entry; a shorter slice only updates the entries it covers.
    pub fn apply(&self, source: &[u32]) {
        debug_assert_eq!(source.len(), self.slots.len(), "source frame size mismatch");

        match &self.execution {
            Execution::Sequential => scatter(&self.slots, source),
            Execution::Parallel { pool, chunk } => pool.install(|| {
                self.slots
                    .par_chunks(*chunk)
                    .zip(source.par_chunks(*chunk))
                    .for_each(|(slots, pixels)| scatter(slots, pixels));
            }),
            Execution::BlockTransfer { isa } => scatter_blocks(*isa, &self.slots, source),
            Execution::ParallelBlockTransfer { pool, chunk, isa } => pool.install(|| {
                self.slots
                    .par_chunks(*chunk)
                    .zip(source.par_chunks(*chunk))
                    .for_each(|(slots, pixels)| scatter_blocks(*isa, slots, pixels));
            }),
        }
    }
}

fn worker_pool() -> Result<ThreadPool, RemapError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(hardware_concurrency())
        .thread_name(|i| format!("keystone-apply-{}", i))
        .build()?;
    Ok(pool)
}

fn block_isa(method: Method, len: usize) -> Result<BlockIsa, RemapError> {
    let isa = BlockIsa::detect().ok_or(RemapError::Unsupported(method.name()))?;
    if len % BLOCK != 0 {
        return Err(RemapError::BlockMisaligned { len });
    }
    Ok(isa)
}

/// Contiguous chunk length for `workers`, rounded up to a multiple of `align`
///
/// With `len % align == 0` every chunk, the last one included, is a
/// multiple of `align`.
fn chunk_len(len: usize, workers: usize, align: usize) -> usize {
    let per_worker = len.div_ceil(workers.max(1));
    (per_worker.div_ceil(align) * align).max(align)
}

#[inline]
fn scatter(slots: &[&AtomicU32], source: &[u32]) {
    for (slot, &pixel) in slots.iter().zip(source) {
        slot.store(pixel, Ordering::Relaxed);
    }
}

/// Block kernel over whole blocks, then a scalar pass over any remainder
fn scatter_blocks(isa: BlockIsa, slots: &[&AtomicU32], source: &[u32]) {
    // SAFETY: a `BlockIsa` is only handed out by `BlockIsa::detect` after the
    // feature was detected at runtime.
    let done = match isa {
        #[cfg(target_arch = "aarch64")]
        BlockIsa::Neon => unsafe { scatter_blocks_neon(slots, source) },
        #[cfg(target_arch = "x86_64")]
        BlockIsa::Sse41 => unsafe { scatter_blocks_sse41(slots, source) },
    };
    scatter(&slots[done..], &source[done..]);
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn scatter_blocks_neon(slots: &[&AtomicU32], source: &[u32]) -> usize {
    use std::arch::aarch64::{vgetq_lane_u32, vld1q_u32};

    let mut done = 0;
    for (dst, src) in slots.chunks_exact(BLOCK).zip(source.chunks_exact(BLOCK)) {
        // SAFETY: `src` holds exactly four readable words
        let words = unsafe { vld1q_u32(src.as_ptr()) };
        dst[0].store(vgetq_lane_u32::<0>(words), Ordering::Relaxed);
        dst[1].store(vgetq_lane_u32::<1>(words), Ordering::Relaxed);
        dst[2].store(vgetq_lane_u32::<2>(words), Ordering::Relaxed);
        dst[3].store(vgetq_lane_u32::<3>(words), Ordering::Relaxed);
        done += BLOCK;
    }
    done
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.1")]
unsafe fn scatter_blocks_sse41(slots: &[&AtomicU32], source: &[u32]) -> usize {
    use std::arch::x86_64::{__m128i, _mm_extract_epi32, _mm_loadu_si128};

    let mut done = 0;
    for (dst, src) in slots.chunks_exact(BLOCK).zip(source.chunks_exact(BLOCK)) {
        // SAFETY: `src` holds exactly four readable words; the load is unaligned
        let words = unsafe { _mm_loadu_si128(src.as_ptr().cast::<__m128i>()) };
        dst[0].store(_mm_extract_epi32::<0>(words) as u32, Ordering::Relaxed);
        dst[1].store(_mm_extract_epi32::<1>(words) as u32, Ordering::Relaxed);
        dst[2].store(_mm_extract_epi32::<2>(words) as u32, Ordering::Relaxed);
        dst[3].store(_mm_extract_epi32::<3>(words) as u32, Ordering::Relaxed);
        done += BLOCK;
    }
    done
}
