//! Token and cost accounting.

use serde::{Deserialize, Serialize};

/// Token usage and cost for one LLM exchange, or an accumulated total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens produced by the model.
    pub output_tokens: u64,
    /// Cost attributed to input tokens, in provider currency units.
    #[serde(default)]
    pub cost_in: f64,
    /// Cost attributed to output tokens.
    #[serde(default)]
    pub cost_out: f64,
}

impl Usage {
    /// Creates a usage record from token counts.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_in: 0.0,
            cost_out: 0.0,
        }
    }

    /// A zeroed usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Attaches per-token costs.
    #[must_use]
    pub const fn with_costs(mut self, cost_in: f64, cost_out: f64) -> Self {
        self.cost_in = cost_in;
        self.cost_out = cost_out;
        self
    }

    /// Total tokens in both directions.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cost_in: self.cost_in + rhs.cost_in,
            cost_out: self.cost_out + rhs.cost_out,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
