//! Sampling decisions for spans the consumer creates.
//!
//! A sampler only decides whether a span is *exported*; the work the span
//! describes always runs.

use rand::Rng;

/// Decides whether a new span should be recorded.
pub trait Sampler: Send + Sync {
    /// `parent_sampled` is the parent's decision, if the span has a parent.
    fn should_sample(&self, parent_sampled: Option<bool>) -> bool;

    /// Short description for logs.
    fn description(&self) -> String;
}

/// Records every span.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOn;

/// Records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOff;

/// Records each span independently with probability `rate`.
#[derive(Debug, Clone, Copy)]
pub struct RateSampler {
    rate: f64,
}

impl RateSampler {
    /// `rate` is clamped into `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Sampler for AlwaysOn {
    fn should_sample(&self, _parent_sampled: Option<bool>) -> bool {
        true
    }

    fn description(&self) -> String {
        "AlwaysOn".to_string()
    }
}

impl Sampler for AlwaysOff {
    fn should_sample(&self, _parent_sampled: Option<bool>) -> bool {
        false
    }

    fn description(&self) -> String {
        "AlwaysOff".to_string()
    }
}

impl Sampler for RateSampler {
    fn should_sample(&self, _parent_sampled: Option<bool>) -> bool {
        rand::thread_rng().gen::<f64>() < self.rate
    }

    fn description(&self) -> String {
        format!("RateSampler{{{}}}", self.rate)
    }
}

/// Builds the sampler for a configured rate: `1.0` and above is
/// [`AlwaysOn`], `0.0` and below is [`AlwaysOff`], anything else a
/// [`RateSampler`].
pub fn sampler_for_rate(rate: f64) -> Box<dyn Sampler> {
    if rate >= 1.0 {
        Box::new(AlwaysOn)
    } else if rate <= 0.0 || rate.is_nan() {
        Box::new(AlwaysOff)
    } else {
        Box::new(RateSampler::new(rate))
    }
}
