pub mod co2eq;

use serde::Serialize;
use uuid::Uuid;

use crate::model::{
    DataSource, EmissionsFactor, GasValue, GwpTable, InventoryValue, InventoryValueState,
    SourceType,
};
use crate::update::{DataSourcePatch, GasEntry, UpdateRequest};

/// Non-fatal conditions observed while recomputing the CO2-equivalent
/// total. Each one means a gas contributed nothing to the sum; none of
/// them aborts the pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    MissingConversionEntry { gas: String },
    MissingGasAmount { gas: String },
    MissingEmissionsFactor { gas: String },
    ValueOutOfRange { gas: String },
}

/// How the line item's data source was resolved. An existing user-owned
/// source is updated in place; a system-provided source is never mutated,
/// a fresh user-owned source supersedes it instead.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Unchanged(Uuid),
    Updated(DataSource),
    Created(DataSource),
}

impl SourceOutcome {
    pub fn datasource_id(&self) -> Uuid {
        match self {
            Self::Unchanged(id) => *id,
            Self::Updated(source) | Self::Created(source) => source.datasource_id,
        }
    }
}

/// The persisted-ready result of one reconciliation pass, applied by the
/// storage collaborator as a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledState {
    pub inventory_value: InventoryValue,
    pub gas_values: Vec<GasValue>,
    pub deleted_gas_value_ids: Vec<Uuid>,
    pub factor_upserts: Vec<EmissionsFactor>,
    pub source: SourceOutcome,
    pub diagnostics: Vec<Diagnostic>,
}

/// Reconcile one line item against an incoming partial update and
/// recompute its CO2-equivalent total.
///
/// Pure over the pre-loaded `existing` snapshot: all persistence happens
/// before (loading) and after (applying the returned state). Fatal
/// conditions are rejected upstream; this pass cannot fail, it can only
/// degrade the total and say so in `diagnostics`.
pub fn reconcile(
    existing: &InventoryValueState,
    update: &UpdateRequest,
    gwp: &GwpTable,
) -> ReconciledState {
    let source = resolve_data_source(existing.data_source.as_ref(), update.data_source.as_ref());

    let mut value = match &existing.value {
        Some(value) => value.clone(),
        None => InventoryValue {
            id: Uuid::new_v4(),
            inventory_id: existing.inventory_id,
            sector_id: Some(existing.sub_category.sector_id),
            sub_sector_id: Some(existing.sub_category.subsector_id),
            sub_category_id: existing.sub_category.subcategory_id,
            gpc_reference_number: None,
            activity_value: None,
            activity_units: None,
            co2eq: None,
            co2eq_years: None,
            unavailable_reason: None,
            unavailable_explanation: None,
            datasource_id: None,
        },
    };

    if let Some(reference) = &update.gpc_reference_number {
        value.gpc_reference_number = Some(reference.clone());
    }
    value.activity_value = update.activity_value.apply(value.activity_value.take());
    value.activity_units = update.activity_units.apply(value.activity_units.take());
    if let Some(reason) = &update.unavailable_reason {
        value.unavailable_reason = Some(reason.clone());
    }
    if let Some(explanation) = &update.unavailable_explanation {
        value.unavailable_explanation = Some(explanation.clone());
    }
    value.datasource_id = Some(source.datasource_id());

    let plan = reconcile_gas_values(existing, update.gas_values.as_deref(), value.id);

    let outcome = co2eq::compute(value.activity_value, &plan.resolved, gwp);
    value.co2eq = Some(outcome.co2eq);
    value.co2eq_years = Some(outcome.co2eq_years);

    ReconciledState {
        inventory_value: value,
        gas_values: plan.resolved.into_iter().map(|(gas, _)| gas).collect(),
        deleted_gas_value_ids: plan.deleted,
        factor_upserts: plan.factor_upserts,
        source,
        diagnostics: outcome.diagnostics,
    }
}

fn resolve_data_source(
    existing: Option<&DataSource>,
    patch: Option<&DataSourcePatch>,
) -> SourceOutcome {
    match existing {
        Some(source) if source.source_type == SourceType::User => match patch {
            Some(patch) => SourceOutcome::Updated(DataSource {
                datasource_id: source.datasource_id,
                source_type: patch.source_type,
                data_quality: Some(patch.data_quality.clone()),
                notes: Some(patch.notes.clone()),
            }),
            None => SourceOutcome::Unchanged(source.datasource_id),
        },
        // No source yet, or a system-provided one: install a fresh
        // user-owned source even when the payload carries no source data.
        _ => SourceOutcome::Created(DataSource {
            datasource_id: Uuid::new_v4(),
            source_type: SourceType::User,
            data_quality: patch.map(|p| p.data_quality.clone()),
            notes: patch.map(|p| p.notes.clone()),
        }),
    }
}

struct GasPlan {
    resolved: Vec<(GasValue, Option<EmissionsFactor>)>,
    deleted: Vec<Uuid>,
    factor_upserts: Vec<EmissionsFactor>,
}

fn reconcile_gas_values(
    existing: &InventoryValueState,
    incoming: Option<&[GasEntry]>,
    inventory_value_id: Uuid,
) -> GasPlan {
    let mut plan = GasPlan {
        resolved: Vec::new(),
        deleted: Vec::new(),
        factor_upserts: Vec::new(),
    };

    // Only reconcile the gas set when the update carries one; an omitted
    // list means the existing gas values stay untouched.
    let Some(entries) = incoming else {
        plan.resolved = existing
            .gas_values
            .iter()
            .map(|gas| {
                let factor = gas
                    .emissions_factor_id
                    .and_then(|id| existing.factor(id))
                    .cloned();
                (gas.clone(), factor)
            })
            .collect();
        return plan;
    };

    for gas in &existing.gas_values {
        let Some(entry) = entries.iter().find(|entry| entry.gas == gas.gas) else {
            // Absent from the request means the user removed this gas.
            plan.deleted.push(gas.gas_value_id);
            continue;
        };

        let mut bound = entry.emissions_factor_id.or(gas.emissions_factor_id);
        let mut factor = bound.and_then(|id| existing.factor(id)).cloned();

        if let Some(data) = &entry.emissions_factor {
            let current = gas.emissions_factor_id.and_then(|id| existing.factor(id));
            let scoped = current
                .filter(|f| f.inventory_id == Some(existing.inventory_id));
            let upsert = match scoped {
                Some(current) => EmissionsFactor {
                    emissions_factor_id: current.emissions_factor_id,
                    gas: data.gas.clone(),
                    units: data.units.clone(),
                    emissions_per_activity: data.emissions_per_activity,
                    inventory_id: current.inventory_id,
                },
                None => EmissionsFactor {
                    emissions_factor_id: Uuid::new_v4(),
                    gas: data.gas.clone(),
                    units: data.units.clone(),
                    emissions_per_activity: data.emissions_per_activity,
                    inventory_id: Some(existing.inventory_id),
                },
            };
            bound = Some(upsert.emissions_factor_id);
            factor = Some(upsert.clone());
            plan.factor_upserts.push(upsert);
        }

        plan.resolved.push((
            GasValue {
                gas_value_id: gas.gas_value_id,
                inventory_value_id,
                gas: gas.gas.clone(),
                gas_amount: entry.gas_amount.apply(gas.gas_amount),
                emissions_factor_id: bound,
            },
            factor,
        ));
    }

    for entry in entries {
        if existing.gas_values.iter().any(|gas| gas.gas == entry.gas) {
            continue;
        }

        let mut bound = entry.emissions_factor_id;
        let mut factor = bound.and_then(|id| existing.factor(id)).cloned();

        if let Some(data) = &entry.emissions_factor {
            let created = EmissionsFactor {
                emissions_factor_id: Uuid::new_v4(),
                gas: data.gas.clone(),
                units: data.units.clone(),
                emissions_per_activity: data.emissions_per_activity,
                inventory_id: Some(existing.inventory_id),
            };
            bound = Some(created.emissions_factor_id);
            factor = Some(created.clone());
            plan.factor_upserts.push(created);
        }

        plan.resolved.push((
            GasValue {
                gas_value_id: Uuid::new_v4(),
                inventory_value_id,
                gas: entry.gas.clone(),
                gas_amount: entry.gas_amount.apply(None),
                emissions_factor_id: bound,
            },
            factor,
        ));
    }

    plan
}
