use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    User,
    System,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Stored rows from imported catalogues may carry other provenance
    /// labels; anything that is not explicitly user-owned is treated as
    /// system-provided and never mutated in place.
    pub fn decode(raw: &str) -> Self {
        match raw {
            "user" => Self::User,
            _ => Self::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub inventory_id: Uuid,
    pub inventory_name: String,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubSector {
    pub subsector_id: Uuid,
    pub sector_id: Uuid,
    pub subsector_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCategory {
    pub subcategory_id: Uuid,
    pub subsector_id: Uuid,
    pub sector_id: Uuid,
    pub reference_number: String,
    pub subcategory_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryValue {
    pub id: Uuid,
    pub inventory_id: Uuid,
    pub sector_id: Option<Uuid>,
    pub sub_sector_id: Option<Uuid>,
    pub sub_category_id: Uuid,
    pub gpc_reference_number: Option<String>,
    pub activity_value: Option<Decimal>,
    pub activity_units: Option<String>,
    pub co2eq: Option<Decimal>,
    pub co2eq_years: Option<i32>,
    pub unavailable_reason: Option<String>,
    pub unavailable_explanation: Option<String>,
    pub datasource_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasValue {
    pub gas_value_id: Uuid,
    pub inventory_value_id: Uuid,
    pub gas: String,
    pub gas_amount: Option<Decimal>,
    pub emissions_factor_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionsFactor {
    pub emissions_factor_id: Uuid,
    pub gas: String,
    pub units: String,
    pub emissions_per_activity: Decimal,
    /// `None` for global/shared factors; `Some` scopes the factor to the
    /// inventory it was defined for.
    pub inventory_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub datasource_id: Uuid,
    pub source_type: SourceType,
    pub data_quality: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GwpEntry {
    pub gas: String,
    pub co2eq_per_kg: i64,
    pub co2eq_years: i32,
}

/// The CO2-equivalence reference table. Rows are unique per
/// (gas, horizon) and kept ordered by gas, then horizon descending, so
/// the per-gas lookup is deterministic when a gas carries several
/// horizons.
#[derive(Debug, Clone, PartialEq)]
pub struct GwpTable {
    entries: Vec<GwpEntry>,
}

impl GwpTable {
    pub fn new(mut entries: Vec<GwpEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.gas
                .cmp(&b.gas)
                .then_with(|| b.co2eq_years.cmp(&a.co2eq_years))
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[GwpEntry] {
        &self.entries
    }

    pub fn matched<'a>(&'a self, gases: &[&str]) -> Vec<&'a GwpEntry> {
        self.entries
            .iter()
            .filter(|entry| gases.contains(&entry.gas.as_str()))
            .collect()
    }
}

/// Everything the aggregator needs about one line item, pre-loaded by the
/// storage collaborator: the line item (absent on first write), its gas
/// values, its data source, and every emissions factor the pass may touch
/// (the ones bound to existing gas values plus any the update references).
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryValueState {
    pub inventory_id: Uuid,
    pub sub_category: SubCategory,
    pub value: Option<InventoryValue>,
    pub gas_values: Vec<GasValue>,
    pub data_source: Option<DataSource>,
    pub factors: Vec<EmissionsFactor>,
}

impl InventoryValueState {
    pub fn factor(&self, id: Uuid) -> Option<&EmissionsFactor> {
        self.factors
            .iter()
            .find(|factor| factor.emissions_factor_id == id)
    }
}
