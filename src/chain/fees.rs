use bitcoin::FeeRate;

/// Picks the fee rate of successive sweep attempts.
///
/// Rates never decrease between attempts so every rebroadcast can replace
/// the previous one, and never exceed `min * max_multiplier`.
#[derive(Debug, Clone)]
pub struct FeeBumper {
    min: FeeRate,
    max: FeeRate,
    last: Option<FeeRate>,
}

impl FeeBumper {
    pub fn new(min: FeeRate, max_multiplier: u64) -> Self {
        let max = FeeRate::from_sat_per_kwu(
            min.to_sat_per_kwu()
                .saturating_mul(max_multiplier.max(1)),
        );
        Self {
            min,
            max,
            last: None,
        }
    }

    /// Resumes bumping from a rate accepted before a restart.
    pub fn with_last(mut self, last: Option<FeeRate>) -> Self {
        self.last = last.map(|rate| rate.min(self.max));
        self
    }

    pub fn max(&self) -> FeeRate {
        self.max
    }

    pub fn last(&self) -> Option<FeeRate> {
        self.last
    }

    /// Next rate given the node's current estimate. On the last safe block
    /// the cap is used regardless of the estimate.
    pub fn next(&mut self, estimate: FeeRate, is_last_chance: bool) -> FeeRate {
        let rate = if is_last_chance {
            self.max
        } else {
            let floor = self.last.unwrap_or(self.min).max(self.min);
            estimate.max(floor).min(self.max)
        };
        self.last = Some(rate);
        rate
    }
}
