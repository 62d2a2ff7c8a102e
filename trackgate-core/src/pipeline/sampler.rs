//! Per-event-name probabilistic sampling

use crate::logging::Log;
use std::collections::HashMap;

/// Source of uniform draws in `[0, 1)`
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG from the `rand` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always returns the same draw
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

pub struct Sampler {
    rates: HashMap<String, f64>,
}

impl Sampler {
    /// Build from configured rates.
    ///
    /// Rates outside (0, 1] or non-finite are dropped with one warning each,
    /// so the affected event names are never sampled out.
    pub fn new(rates: &HashMap<String, f64>, log: &Log) -> Self {
        let mut valid = HashMap::new();
        for (name, &rate) in rates {
            if rate.is_finite() && rate > 0.0 && rate <= 1.0 {
                valid.insert(name.clone(), rate);
            } else {
                log.emit(
                    crate::logging::LogLevel::Warn,
                    "sampler",
                    "ignoring invalid sampling rate",
                    vec![("event", name.clone()), ("rate", rate.to_string())],
                );
            }
        }
        Self { rates: valid }
    }

    /// Sampler that keeps everything
    pub fn disabled() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    pub fn rate_for(&self, name: &str) -> f64 {
        self.rates.get(name).copied().unwrap_or(1.0)
    }

    pub fn should_sample(&self, name: &str, random: &dyn RandomSource) -> bool {
        let rate = self.rate_for(name);
        if rate >= 1.0 {
            return true;
        }
        random.next_f64() < rate
    }
}
