use rand::{rng, Rng};
use tokio::time::Duration;

pub trait ExponentialBackoff: Sized {
    /// Picks a delay for the retry following `attempt` failed attempts,
    /// treating `self` as the base delay.
    ///
    /// The first retry is immediate. Later retries draw uniformly from
    /// `[base, min(cap, base * 2^(attempt - 2))]`.
    fn decorrelated_jitter(&self, cap: Self, attempt: u32) -> Self;
}

impl ExponentialBackoff for Duration {
    fn decorrelated_jitter(&self, cap: Self, attempt: u32) -> Self {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 2).min(31);
        let ceiling = self.saturating_mul(1 << exponent).min(cap);
        if ceiling <= *self {
            return ceiling;
        }

        let mut rng = rng();
        let nanos = rng.random_range(self.as_nanos()..=ceiling.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}
