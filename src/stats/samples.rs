use serde::Serialize;

/// Fixed-capacity circular buffer of response-time samples.
///
/// Writes are O(1) and overwrite the oldest sample once full, so memory is
/// constant after `capacity` samples. Percentiles sort a copy of the live
/// portion at read time — reads are rare (bounded by traffic on the
/// observability endpoints), writes are every request.
pub struct SampleBuffer {
    samples: Vec<f64>,
    capacity: usize,
    next: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: vec![0.0; capacity],
            capacity,
            next: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn percentiles(&self) -> Percentiles {
        if self.len == 0 {
            return Percentiles::default();
        }
        let mut live: Vec<f64> = self.samples[..self.len].to_vec();
        live.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Percentiles {
            p50: rank(&live, 0.50),
            p95: rank(&live, 0.95),
            p99: rank(&live, 0.99),
        }
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.len = 0;
    }
}

fn rank(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
