use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Items the closet can physically present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Accessory {
    Umbrella,
    SunProtection,
    Mask,
    Warmth,
}

/// Set of accessories, ordered so logs and hardware commands are deterministic.
pub type AccessorySet = BTreeSet<Accessory>;

impl Accessory {
    pub const ALL: [Accessory; 4] = [
        Accessory::Umbrella,
        Accessory::SunProtection,
        Accessory::Mask,
        Accessory::Warmth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Accessory::Umbrella => "umbrella",
            Accessory::SunProtection => "sun-protection",
            Accessory::Mask => "mask",
            Accessory::Warmth => "warmth",
        }
    }
}

impl fmt::Display for Accessory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown accessory '{0}'")]
pub struct UnknownAccessory(pub String);

impl FromStr for Accessory {
    type Err = UnknownAccessory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Older dashboards used sunscreen / hand-warmer naming
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "umbrella" => Ok(Accessory::Umbrella),
            "sun-protection" | "sunscreen" => Ok(Accessory::SunProtection),
            "mask" => Ok(Accessory::Mask),
            "warmth" | "hand-warmer" => Ok(Accessory::Warmth),
            _ => Err(UnknownAccessory(s.to_string())),
        }
    }
}

/// Render a set as `umbrella, mask` for log lines.
pub fn describe(set: &AccessorySet) -> String {
    if set.is_empty() {
        return "nothing".to_string();
    }
    set.iter()
        .map(Accessory::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
