use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitsState {
    /// Within the operational (green low to green high) range.
    Blue,
    Green,
    GreenLow,
    GreenHigh,
    YellowLow,
    YellowHigh,
    RedLow,
    RedHigh,
}

impl Display for LimitsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitsState::Blue => "BLUE",
            LimitsState::Green => "GREEN",
            LimitsState::GreenLow => "GREEN_LOW",
            LimitsState::GreenHigh => "GREEN_HIGH",
            LimitsState::YellowLow => "YELLOW_LOW",
            LimitsState::YellowHigh => "YELLOW_HIGH",
            LimitsState::RedLow => "RED_LOW",
            LimitsState::RedHigh => "RED_HIGH",
        };
        write!(f, "{s}")
    }
}

fn default_persistence() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Limit thresholds for a numeric item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub red_low: f64,
    pub yellow_low: f64,
    pub yellow_high: f64,
    pub red_high: f64,
    #[serde(default)]
    pub green_low: Option<f64>,
    #[serde(default)]
    pub green_high: Option<f64>,
    /// Consecutive samples required before a state change is reported.
    #[serde(default = "default_persistence")]
    pub persistence: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Limits {
    #[must_use]
    pub fn new(red_low: f64, yellow_low: f64, yellow_high: f64, red_high: f64) -> Self {
        Self {
            red_low,
            yellow_low,
            yellow_high,
            red_high,
            green_low: None,
            green_high: None,
            persistence: 1,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_green(mut self, green_low: f64, green_high: f64) -> Self {
        self.green_low = Some(green_low);
        self.green_high = Some(green_high);
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: u32) -> Self {
        self.persistence = persistence;
        self
    }

    /// Ensure the thresholds are ordered.
    ///
    /// # Errors
    /// [Error::Configuration] if they are not.
    pub fn validate(&self) -> Result<()> {
        let mut ordered = vec![self.red_low, self.yellow_low];
        if let (Some(gl), Some(gh)) = (self.green_low, self.green_high) {
            ordered.extend([gl, gh]);
        } else if self.green_low.is_some() || self.green_high.is_some() {
            return Err(Error::Configuration(
                "green_low and green_high must be given together".to_string(),
            ));
        }
        ordered.extend([self.yellow_high, self.red_high]);
        if ordered.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Configuration(format!(
                "limits must be ordered red_low <= yellow_low <= [green_low <= green_high <=] yellow_high <= red_high, got {ordered:?}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn evaluate(&self, value: f64) -> LimitsState {
        if value < self.red_low {
            LimitsState::RedLow
        } else if value > self.red_high {
            LimitsState::RedHigh
        } else if value < self.yellow_low {
            LimitsState::YellowLow
        } else if value > self.yellow_high {
            LimitsState::YellowHigh
        } else {
            match (self.green_low, self.green_high) {
                (Some(gl), _) if value < gl => LimitsState::GreenLow,
                (_, Some(gh)) if value > gh => LimitsState::GreenHigh,
                (Some(_), Some(_)) => LimitsState::Blue,
                _ => LimitsState::Green,
            }
        }
    }
}

/// Per packet instance limits state with persistence.
#[derive(Debug, Clone, Default)]
pub(crate) struct LimitsTracker {
    pub state: Option<LimitsState>,
    pending: Option<LimitsState>,
    count: u32,
}

impl LimitsTracker {
    /// Feed a sample. Returns the current state after applying persistence.
    pub fn update(&mut self, limits: &Limits, value: f64) -> Option<LimitsState> {
        let sample = limits.evaluate(value);
        match self.state {
            None => {
                self.state = Some(sample);
                self.pending = None;
                self.count = 0;
            }
            Some(current) if current == sample => {
                self.pending = None;
                self.count = 0;
            }
            Some(_) => {
                if self.pending == Some(sample) {
                    self.count += 1;
                } else {
                    self.pending = Some(sample);
                    self.count = 1;
                }
                if self.count >= limits.persistence.max(1) {
                    self.state = Some(sample);
                    self.pending = None;
                    self.count = 0;
                }
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(-11.0, LimitsState::RedLow)]
    #[test_case(-6.0, LimitsState::YellowLow)]
    #[test_case(-2.0, LimitsState::GreenLow)]
    #[test_case(0.0, LimitsState::Blue)]
    #[test_case(2.0, LimitsState::GreenHigh)]
    #[test_case(6.0, LimitsState::YellowHigh)]
    #[test_case(11.0, LimitsState::RedHigh)]
    fn evaluate_with_operational_range(value: f64, expected: LimitsState) {
        let limits = Limits::new(-10.0, -5.0, 5.0, 10.0).with_green(-1.0, 1.0);
        assert_eq!(limits.evaluate(value), expected);
    }

    #[test]
    fn evaluate_without_green_is_green() {
        let limits = Limits::new(-10.0, -5.0, 5.0, 10.0);
        assert_eq!(limits.evaluate(4.9), LimitsState::Green);
    }

    #[test]
    fn validate_rejects_unordered() {
        assert!(Limits::new(1.0, 0.0, 5.0, 10.0).validate().is_err());
        assert!(Limits::new(0.0, 1.0, 5.0, 10.0).with_green(6.0, 7.0).validate().is_err());
        assert!(Limits::new(0.0, 1.0, 5.0, 10.0).validate().is_ok());
    }

    #[test]
    fn persistence_delays_state_change() {
        let limits = Limits::new(-10.0, -5.0, 5.0, 10.0).with_persistence(3);
        let mut tracker = LimitsTracker::default();
        assert_eq!(tracker.update(&limits, 0.0), Some(LimitsState::Green));
        assert_eq!(tracker.update(&limits, 20.0), Some(LimitsState::Green));
        assert_eq!(tracker.update(&limits, 20.0), Some(LimitsState::Green));
        assert_eq!(tracker.update(&limits, 20.0), Some(LimitsState::RedHigh));
        // a single good sample does not reset a red state with persistence
        assert_eq!(tracker.update(&limits, 0.0), Some(LimitsState::RedHigh));
    }
}
