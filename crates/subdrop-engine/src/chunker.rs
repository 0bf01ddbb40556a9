//! Chunk sizing policies.
//!
//! The sender slices a file into chunks and may resize them as throughput
//! samples come in. The adaptive policy grows chunks on fast links and
//! shrinks them when throughput drops or per-chunk latency climbs, always
//! inside hard bounds so a single chunk can never exceed the frame cap.

use std::collections::VecDeque;
use std::time::Duration;
use subdrop_proto::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Decides the size of the next chunk and consumes throughput samples.
pub trait ChunkPolicy: Send {
    /// Size to use for the next chunk.
    fn chunk_size(&self) -> usize;

    /// Record one sent chunk: its size and how long the write took.
    fn record(&mut self, bytes: usize, elapsed: Duration);
}

/// Constant chunk size.
#[derive(Debug, Clone, Copy)]
pub struct FixedChunk(pub usize);

impl Default for FixedChunk {
    fn default() -> Self {
        Self(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkPolicy for FixedChunk {
    fn chunk_size(&self) -> usize {
        self.0.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    fn record(&mut self, _bytes: usize, _elapsed: Duration) {}
}

const SPEED_WINDOW: usize = 10;
const WARMUP_SAMPLES: usize = 3;
const AVG_SAMPLES: usize = 5;
const TREND_SAMPLES: usize = 3;

const FAST_BPS: f64 = 1024.0 * 1024.0;
const MEDIUM_BPS: f64 = 512.0 * 1024.0;
const SLOW_BPS: f64 = 100.0 * 1024.0;
const HIGH_LATENCY: Duration = Duration::from_millis(200);

/// Throughput-adaptive chunk sizing.
///
/// Keeps a short window of speed samples; once warmed up, the next chunk
/// size is the base size scaled by the current speed band (4x fast, 2x
/// medium, half slow), nudged by the recent trend and cut back when the last
/// chunk took too long to write.
#[derive(Debug)]
pub struct AdaptiveChunk {
    base: usize,
    current: usize,
    speeds: VecDeque<f64>,
    last_elapsed: Duration,
}

impl Default for AdaptiveChunk {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl AdaptiveChunk {
    pub fn new(base: usize) -> Self {
        let base = base.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        Self {
            base,
            current: base,
            speeds: VecDeque::with_capacity(SPEED_WINDOW),
            last_elapsed: Duration::ZERO,
        }
    }

    /// Most recent throughput sample in bytes per second.
    pub fn current_speed(&self) -> Option<f64> {
        self.speeds.back().copied()
    }

    /// Mean throughput over the sample window in bytes per second.
    pub fn average_speed(&self) -> Option<f64> {
        if self.speeds.is_empty() {
            return None;
        }
        let sum: f64 = self.speeds.iter().sum();
        Some(sum / self.speeds.len() as f64)
    }

    /// Estimated time to move `remaining` more bytes at the average speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.average_speed()?;
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    fn mean(&self, n: usize) -> Option<f64> {
        if self.speeds.len() < n {
            return None;
        }
        let sum: f64 = self.speeds.iter().rev().take(n).sum();
        Some(sum / n as f64)
    }

    fn mean_before(&self, skip: usize, n: usize) -> Option<f64> {
        if self.speeds.len() < skip + n {
            return None;
        }
        let sum: f64 = self.speeds.iter().rev().skip(skip).take(n).sum();
        Some(sum / n as f64)
    }

    fn adapt(&mut self) {
        if self.speeds.len() < WARMUP_SAMPLES {
            return;
        }
        let avg = match self.mean(AVG_SAMPLES.min(self.speeds.len())) {
            Some(avg) => avg,
            None => return,
        };

        let mut factor = if avg >= FAST_BPS {
            4.0
        } else if avg >= MEDIUM_BPS {
            2.0
        } else if avg < SLOW_BPS {
            0.5
        } else {
            1.0
        };

        if let (Some(recent), Some(earlier)) = (
            self.mean(TREND_SAMPLES),
            self.mean_before(TREND_SAMPLES, TREND_SAMPLES),
        ) {
            if earlier > 0.0 {
                let trend = recent / earlier;
                if trend > 1.2 {
                    factor *= 1.2;
                } else if trend < 0.8 {
                    factor *= 0.8;
                }
            }
        }

        if self.last_elapsed > HIGH_LATENCY {
            factor *= 0.7;
        }

        let next = (self.base as f64 * factor) as usize;
        self.current = next.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }
}

impl ChunkPolicy for AdaptiveChunk {
    fn chunk_size(&self) -> usize {
        self.current
    }

    fn record(&mut self, bytes: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        // Sub-microsecond writes give garbage speed samples; treat them as
        // one microsecond.
        let secs = secs.max(1e-6);
        if self.speeds.len() == SPEED_WINDOW {
            self.speeds.pop_front();
        }
        self.speeds.push_back(bytes as f64 / secs);
        self.last_elapsed = elapsed;
        self.adapt();
    }
}
