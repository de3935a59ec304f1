/// Continuous exponential decay: `lr = initial * rate^(step / decay_steps)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub initial: f64,
    pub decay_steps: u64,
    pub decay_rate: f64,
}

impl Default for ExponentialDecay {
    fn default() -> Self {
        Self {
            initial: 1e-3,
            decay_steps: 60_000,
            decay_rate: 0.5,
        }
    }
}

impl ExponentialDecay {
    pub fn lr_at(&self, step: u64) -> f64 {
        let steps = self.decay_steps.max(1) as f64;
        self.initial * self.decay_rate.powf(step as f64 / steps)
    }
}
