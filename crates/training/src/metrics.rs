//! Running scalar metrics reset at every evaluation interval.

/// Unweighted mean of the values seen since the last reset.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    total: f64,
    count: u64,
}

impl Mean {
    pub fn update(&mut self, value: f32) {
        self.total += value as f64;
        self.count += 1;
    }

    /// 0 when nothing was recorded.
    pub fn result(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.total / self.count as f64) as f32
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Fraction of pixels whose arg-max class equals the label, pooled over all updates.
#[derive(Debug, Clone, Default)]
pub struct PixelAccuracy {
    correct: u64,
    total: u64,
}

impl PixelAccuracy {
    pub fn update(&mut self, correct: u64, total: u64) {
        self.correct += correct;
        self.total += total;
    }

    pub fn result(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.correct as f64 / self.total as f64) as f32
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
