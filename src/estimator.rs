use std::{collections::VecDeque, time::Duration};

pub const DEFAULT_WINDOW_SIZE: usize = 5;

/// A sample with zero duration, or one whose rate truncates to 0 kbps, has no reciprocal.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EstimateError {
    #[error("division by zero at sample {index} ({bytes} bytes in {duration:?})")]
    DivisionByZero {
        index: usize,
        bytes: u64,
        duration: Duration,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub duration: Duration,
}

impl ThroughputSample {
    /// Integer-truncated kilobits (1024 bits) per second.
    pub fn kbps(&self) -> Option<u64> {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some((self.bytes as f64 * 8.0 / secs / 1024.0).floor() as u64)
    }
}

/// Sliding window of recent downloads, summarized by their harmonic mean.
#[derive(Clone, Debug)]
pub struct ThroughputEstimator {
    samples: VecDeque<ThroughputSample>,
    window_size: usize,
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ThroughputEstimator {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            samples: VecDeque::with_capacity(window_size + 1),
            window_size,
        }
    }

    pub fn record(&mut self, bytes: u64, duration: Duration) {
        self.samples.push_back(ThroughputSample { bytes, duration });
        while self.samples.len() > self.window_size {
            self.samples.pop_front();
        }
    }

    /// Harmonic mean in kbps, or `None` before the first sample.
    pub fn estimate(&self) -> Result<Option<f64>, EstimateError> {
        if self.samples.is_empty() {
            return Ok(None);
        }

        let mut reciprocal_sum = 0.0;
        for (index, sample) in self.samples.iter().enumerate() {
            match sample.kbps() {
                Some(kbps) if kbps > 0 => reciprocal_sum += 1.0 / kbps as f64,
                _ => {
                    return Err(EstimateError::DivisionByZero {
                        index,
                        bytes: sample.bytes,
                        duration: sample.duration,
                    });
                }
            }
        }

        Ok(Some(self.samples.len() as f64 / reciprocal_sum))
    }

    pub fn samples(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.samples.iter()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
