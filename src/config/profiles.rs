use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::settings::SizingSettings;

/// Position-sizing presets, from most to least cautious
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingProfile {
    /// Small cap, steep cuts in turbulent regimes
    Conservative,
    /// Half-Kelly with a 25% ceiling
    Moderate,
    /// Larger cap, gentler regime discounts
    Aggressive,
}

impl SizingProfile {
    pub fn name(&self) -> &str {
        match self {
            Self::Conservative => "Conservative",
            Self::Moderate => "Moderate",
            Self::Aggressive => "Aggressive",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Conservative => "Quarter-Kelly, 10% ceiling, 0.5/0.2 regime discounts.",
            Self::Moderate => "Half-Kelly, 25% ceiling, 0.6/0.3 regime discounts.",
            Self::Aggressive => "Half-Kelly, 40% ceiling, 0.75/0.4 regime discounts.",
        }
    }

    pub fn settings(&self) -> SizingSettings {
        match self {
            Self::Conservative => SizingSettings {
                half_kelly_factor: 0.25,
                low_vol_multiplier: 1.0,
                med_vol_multiplier: 0.5,
                high_vol_multiplier: 0.2,
                max_allowed: 0.10,
                assumed_payoff_ratio: None,
            },
            Self::Moderate => SizingSettings::default(),
            Self::Aggressive => SizingSettings {
                half_kelly_factor: 0.5,
                low_vol_multiplier: 1.0,
                med_vol_multiplier: 0.75,
                high_vol_multiplier: 0.4,
                max_allowed: 0.40,
                assumed_payoff_ratio: None,
            },
        }
    }
}

impl FromStr for SizingProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "moderate" => Ok(Self::Moderate),
            "aggressive" => Ok(Self::Aggressive),
            _ => Err(anyhow::anyhow!("Unknown sizing profile: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_settings_are_valid_and_ordered() {
        let conservative = SizingProfile::Conservative.settings();
        let moderate = SizingProfile::Moderate.settings();
        let aggressive = SizingProfile::Aggressive.settings();

        for settings in [&conservative, &moderate, &aggressive] {
            assert!(settings.validate().is_empty());
        }
        assert!(conservative.max_allowed < moderate.max_allowed);
        assert!(moderate.max_allowed < aggressive.max_allowed);
        assert_eq!(moderate.max_allowed, 0.25);
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("Aggressive".parse::<SizingProfile>().unwrap(), SizingProfile::Aggressive);
        assert!("reckless".parse::<SizingProfile>().is_err());
        assert_eq!(SizingProfile::Moderate.name(), "Moderate");
    }
}
