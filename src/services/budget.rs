use serde::{Deserialize, Serialize};

/// Price model for per-minute billed speech synthesis.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct CostModel {
    /// Assumed speaking rate used to predict audio length from text.
    #[serde(default = "default_chars_per_second")]
    pub chars_per_second: f64,
    #[serde(default = "default_usd_per_minute")]
    pub usd_per_minute: f64,
}

fn default_chars_per_second() -> f64 {
    15.0
}
fn default_usd_per_minute() -> f64 {
    0.015
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            chars_per_second: default_chars_per_second(),
            usd_per_minute: default_usd_per_minute(),
        }
    }
}

impl CostModel {
    pub fn free() -> Self {
        Self {
            usd_per_minute: 0.0,
            ..Self::default()
        }
    }

    pub fn estimate_secs(&self, chars: usize) -> f64 {
        if self.chars_per_second <= 0.0 {
            return 0.0;
        }
        chars as f64 / self.chars_per_second
    }

    pub fn estimate_usd(&self, chars: usize) -> f64 {
        self.estimate_secs(chars) / 60.0 * self.usd_per_minute
    }

    pub fn usd_for_duration(&self, secs: f64) -> f64 {
        secs.max(0.0) / 60.0 * self.usd_per_minute
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    /// Spend already reached the ceiling.
    Exhausted,
    /// The next item's estimate would push spend past the ceiling.
    WouldExceed { estimate: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admit,
    Stop(StopReason),
}

/// Running spend against an operator-supplied ceiling (USD).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    ceiling: f64,
    spent: f64,
}

impl Budget {
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling: ceiling.max(0.0),
            spent: 0.0,
        }
    }

    /// Checked before every paid call.
    pub fn admit(&self, estimate: f64) -> Admission {
        if self.ceiling > 0.0 && self.spent >= self.ceiling {
            return Admission::Stop(StopReason::Exhausted);
        }
        if self.spent + estimate > self.ceiling {
            return Admission::Stop(StopReason::WouldExceed { estimate });
        }
        Admission::Admit
    }

    pub fn record(&mut self, cost: f64) {
        self.spent += cost.max(0.0);
    }

    pub fn spent(&self) -> f64 {
        self.spent
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn remaining(&self) -> f64 {
        (self.ceiling - self.spent).max(0.0)
    }
}
