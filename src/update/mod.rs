use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::model::SourceType;

/// Three-way merge semantics for fields that are nullable *and* optional
/// in the wire payload: an absent key keeps the stored value, an explicit
/// `null` clears it, a value replaces it.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T: Clone> Patch<T> {
    fn from_raw(raw: Option<Option<T>>) -> Self {
        match raw {
            None => Self::Keep,
            Some(None) => Self::Clear,
            Some(Some(value)) => Self::Set(value),
        }
    }

    pub fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Self::Keep => current,
            Self::Clear => None,
            Self::Set(value) => Some(value.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub gpc_reference_number: Option<String>,
    pub activity_value: Patch<Decimal>,
    pub activity_units: Patch<String>,
    pub unavailable_reason: Option<String>,
    pub unavailable_explanation: Option<String>,
    pub gas_values: Option<Vec<GasEntry>>,
    pub data_source: Option<DataSourcePatch>,
}

impl UpdateRequest {
    /// Factor ids the payload references explicitly; the storage
    /// collaborator pre-loads these so reconciliation never touches
    /// persistence itself.
    pub fn referenced_factor_ids(&self) -> Vec<Uuid> {
        let mut ids = self
            .gas_values
            .iter()
            .flatten()
            .filter_map(|entry| entry.emissions_factor_id)
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GasEntry {
    pub gas: String,
    pub gas_amount: Patch<Decimal>,
    pub emissions_factor_id: Option<Uuid>,
    pub emissions_factor: Option<FactorData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorData {
    pub emissions_per_activity: Decimal,
    pub gas: String,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSourcePatch {
    pub source_type: SourceType,
    pub data_quality: String,
    pub notes: String,
}

#[derive(Debug)]
pub enum ValidationError {
    Json(serde_json::Error),
    EmptyGas,
    DuplicateGas(String),
    NegativeGasAmount(String),
    FractionalGasAmount(String),
    NegativeActivityValue,
    NegativeEmissionsPerActivity(String),
    InvalidEmissionsFactorId { gas: String, value: String },
    InvalidSourceType(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "{err}"),
            Self::EmptyGas => write!(f, "gas identifier must not be empty"),
            Self::DuplicateGas(gas) => {
                write!(f, "gas `{gas}` appears more than once in gasValues")
            }
            Self::NegativeGasAmount(gas) => {
                write!(f, "gasAmount for gas `{gas}` must not be negative")
            }
            Self::FractionalGasAmount(gas) => {
                write!(f, "gasAmount for gas `{gas}` must be an integer mass")
            }
            Self::NegativeActivityValue => {
                write!(f, "activityValue must not be negative")
            }
            Self::NegativeEmissionsPerActivity(gas) => {
                write!(f, "emissionsPerActivity for gas `{gas}` must not be negative")
            }
            Self::InvalidEmissionsFactorId { gas, value } => {
                write!(f, "emissionsFactorId `{value}` for gas `{gas}` is not a valid UUID")
            }
            Self::InvalidSourceType(value) => {
                write!(f, "unknown sourceType `{value}`")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<serde_json::Error> for ValidationError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Parse and validate a raw update payload. Everything past this boundary
/// operates on fully-typed, already-validated data.
pub fn parse_update(payload: &str) -> Result<UpdateRequest, ValidationError> {
    let raw: RawUpdate = serde_json::from_str(payload)?;
    raw.into_request()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUpdate {
    gpc_reference_number: Option<String>,
    #[serde(default, deserialize_with = "some_or_null")]
    activity_value: Option<Option<Decimal>>,
    #[serde(default, deserialize_with = "some_or_null")]
    activity_units: Option<Option<String>>,
    unavailable_reason: Option<String>,
    unavailable_explanation: Option<String>,
    gas_values: Option<Vec<RawGasEntry>>,
    data_source: Option<RawDataSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGasEntry {
    gas: String,
    #[serde(default, deserialize_with = "some_or_null")]
    gas_amount: Option<Option<Decimal>>,
    emissions_factor_id: Option<String>,
    emissions_factor: Option<RawFactor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFactor {
    emissions_per_activity: Decimal,
    gas: String,
    units: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataSource {
    source_type: String,
    data_quality: String,
    notes: String,
}

fn some_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl RawUpdate {
    fn into_request(self) -> Result<UpdateRequest, ValidationError> {
        let activity_value = Patch::from_raw(self.activity_value);
        if let Patch::Set(value) = &activity_value
            && value.is_sign_negative()
            && !value.is_zero()
        {
            return Err(ValidationError::NegativeActivityValue);
        }

        let gas_values = match self.gas_values {
            None => None,
            Some(raw_entries) => {
                let mut entries = Vec::with_capacity(raw_entries.len());
                for raw in raw_entries {
                    let entry = raw.into_entry()?;
                    if entries.iter().any(|e: &GasEntry| e.gas == entry.gas) {
                        return Err(ValidationError::DuplicateGas(entry.gas));
                    }
                    entries.push(entry);
                }
                Some(entries)
            }
        };

        let data_source = match self.data_source {
            None => None,
            Some(raw) => {
                let source_type = SourceType::parse(&raw.source_type)
                    .ok_or(ValidationError::InvalidSourceType(raw.source_type))?;
                Some(DataSourcePatch {
                    source_type,
                    data_quality: raw.data_quality,
                    notes: raw.notes,
                })
            }
        };

        Ok(UpdateRequest {
            gpc_reference_number: self.gpc_reference_number,
            activity_value,
            activity_units: Patch::from_raw(self.activity_units),
            unavailable_reason: self.unavailable_reason,
            unavailable_explanation: self.unavailable_explanation,
            gas_values,
            data_source,
        })
    }
}

impl RawGasEntry {
    fn into_entry(self) -> Result<GasEntry, ValidationError> {
        if self.gas.trim().is_empty() {
            return Err(ValidationError::EmptyGas);
        }

        let gas_amount = Patch::from_raw(self.gas_amount);
        if let Patch::Set(amount) = &gas_amount {
            if amount.is_sign_negative() && !amount.is_zero() {
                return Err(ValidationError::NegativeGasAmount(self.gas));
            }
            if !amount.fract().is_zero() {
                return Err(ValidationError::FractionalGasAmount(self.gas));
            }
        }

        let emissions_factor_id = match self.emissions_factor_id {
            None => None,
            Some(raw) => Some(Uuid::parse_str(&raw).map_err(|_| {
                ValidationError::InvalidEmissionsFactorId {
                    gas: self.gas.clone(),
                    value: raw,
                }
            })?),
        };

        let emissions_factor = match self.emissions_factor {
            None => None,
            Some(raw) => {
                if raw.emissions_per_activity.is_sign_negative()
                    && !raw.emissions_per_activity.is_zero()
                {
                    return Err(ValidationError::NegativeEmissionsPerActivity(self.gas));
                }
                Some(FactorData {
                    emissions_per_activity: raw.emissions_per_activity,
                    gas: raw.gas,
                    units: raw.units,
                })
            }
        };

        Ok(GasEntry {
            gas: self.gas,
            gas_amount,
            emissions_factor_id,
            emissions_factor,
        })
    }
}
