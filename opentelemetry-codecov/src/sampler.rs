//! Probability draws used to pick capture owners and untracked spans.
use opentelemetry::trace::SpanKind;
use rand::Rng;

/// A single Bernoulli draw with a fixed probability.
///
/// The boundaries are exact: a rate of `0.0` never selects and a rate of
/// `1.0` always selects, without touching the random number generator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSampler {
    rate: f64,
}

impl RateSampler {
    /// Create a sampler. The rate is clamped to `[0, 1]`.
    pub fn new(rate: f64) -> Self {
        RateSampler {
            rate: rate.clamp(0.0, 1.0),
        }
    }

    /// The configured probability.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Draw once.
    pub fn sample(&self) -> bool {
        if self.rate <= 0.0 {
            false
        } else if self.rate >= 1.0 {
            true
        } else {
            rand::rng().random::<f64>() < self.rate
        }
    }
}

/// Decides whether a starting span may become the capture owner.
#[derive(Clone, Debug)]
pub struct CaptureSampler {
    rate: RateSampler,
    allowed_kinds: Vec<SpanKind>,
}

impl CaptureSampler {
    /// Create a sampler. An empty `allowed_kinds` allows every kind.
    pub fn new(rate: f64, allowed_kinds: Vec<SpanKind>) -> Self {
        CaptureSampler {
            rate: RateSampler::new(rate),
            allowed_kinds,
        }
    }

    /// Whether the decision depends on the span kind at all.
    pub fn filters_kinds(&self) -> bool {
        !self.allowed_kinds.is_empty()
    }

    /// Draw for a span. A span whose kind is unknown or not allowed is never
    /// sampled while a kind filter is configured.
    pub fn should_sample(&self, kind: Option<&SpanKind>) -> bool {
        if self.filters_kinds() {
            match kind {
                Some(kind) if self.allowed_kinds.contains(kind) => {}
                _ => return false,
            }
        }
        self.rate.sample()
    }
}
