use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::model::{GwpEntry, GwpTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub gwp: Vec<GwpOverride>,
}

/// One CO2-equivalence row supplied by configuration, replacing the
/// seeded row with the same (gas, horizon) key or extending the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwpOverride {
    pub gas: String,
    pub co2eq_per_kg: i64,
    pub co2eq_years: i32,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    gwp: Option<Vec<RawGwpEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawGwpEntry {
    gas: String,
    co2eq_per_kg: i64,
    #[serde(default = "default_horizon")]
    co2eq_years: i32,
}

fn default_horizon() -> i32 {
    100
}

impl RawGwpEntry {
    fn into_override(self) -> Result<GwpOverride, ConfigError> {
        if self.gas.trim().is_empty() {
            return Err(ConfigError::InvalidGwp(
                "gas identifier must not be empty".to_string(),
            ));
        }
        if self.co2eq_per_kg < 0 {
            return Err(ConfigError::InvalidGwp(format!(
                "co2eq_per_kg for `{}` must not be negative",
                self.gas
            )));
        }
        if self.co2eq_years <= 0 {
            return Err(ConfigError::InvalidGwp(format!(
                "co2eq_years for `{}` must be positive",
                self.gas
            )));
        }
        Ok(GwpOverride {
            gas: self.gas,
            co2eq_per_kg: self.co2eq_per_kg,
            co2eq_years: self.co2eq_years,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    InvalidGwp(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Yaml(err) => write!(f, "{err}"),
            Self::InvalidGwp(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

/// Load user-level then repo-level configuration; the nearer layer wins
/// per (gas, horizon) key.
pub fn load_effective_config(
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig { gwp: Vec::new() };

    if let Some(path) = user_config.filter(|path| path.exists()) {
        let layer = load_config_file(path)?;
        merge_gwp_dedup(&mut merged.gwp, layer.gwp);
    }
    if let Some(path) = repo_config.filter(|path| path.exists()) {
        let layer = load_config_file(path)?;
        merge_gwp_dedup(&mut merged.gwp, layer.gwp);
    }

    Ok(merged)
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<EffectiveConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(content)?;
    let raw_entries = raw.gwp.unwrap_or_default();
    let mut gwp = Vec::with_capacity(raw_entries.len());
    for entry in raw_entries {
        gwp.push(entry.into_override()?);
    }
    Ok(EffectiveConfig { gwp })
}

fn merge_gwp_dedup(existing: &mut Vec<GwpOverride>, incoming: Vec<GwpOverride>) {
    for entry in incoming {
        if let Some(slot) = existing
            .iter_mut()
            .find(|e| e.gas == entry.gas && e.co2eq_years == entry.co2eq_years)
        {
            *slot = entry;
        } else {
            existing.push(entry);
        }
    }
}

/// Apply configured rows over the seeded table: same (gas, horizon) key
/// replaces, anything else extends.
pub fn apply_gwp_overrides(table: GwpTable, overrides: &[GwpOverride]) -> GwpTable {
    let mut entries = table.entries().to_vec();
    for entry in overrides {
        entries.retain(|e| !(e.gas == entry.gas && e.co2eq_years == entry.co2eq_years));
        entries.push(GwpEntry {
            gas: entry.gas.clone(),
            co2eq_per_kg: entry.co2eq_per_kg,
            co2eq_years: entry.co2eq_years,
        });
    }
    GwpTable::new(entries)
}

pub fn default_config_yaml() -> String {
    r#"# Override or extend the seeded CO2-equivalence table, e.g. to switch
# a gas to 20-year accounting:
#
# gwp:
#   - gas: CH4
#     co2eq_per_kg: 84
#     co2eq_years: 20
gwp: []
"#
    .to_string()
}
