use rust_decimal::Decimal;
use tracing::warn;

use super::Diagnostic;
use crate::model::{EmissionsFactor, GasValue, GwpTable};

#[derive(Debug, Clone, PartialEq)]
pub struct Co2eqOutcome {
    pub co2eq: Decimal,
    pub co2eq_years: i32,
    pub diagnostics: Vec<Diagnostic>,
}

/// Recompute the CO2-equivalent total over the reconciled gas set.
///
/// Per gas: with an activity value and a resolved factor the mass is
/// `activity * emissionsPerActivity` truncated to an integer, otherwise
/// the directly entered amount. A gas with no usable mass or no
/// conversion entry contributes nothing and is reported, never fatal.
/// The horizon is the maximum over every conversion row matching the gas
/// set, including rows whose gas ended up contributing nothing.
pub fn compute(
    activity_value: Option<Decimal>,
    gas_values: &[(GasValue, Option<EmissionsFactor>)],
    table: &GwpTable,
) -> Co2eqOutcome {
    let mut gases = gas_values
        .iter()
        .map(|(gas, _)| gas.gas.as_str())
        .collect::<Vec<_>>();
    gases.sort_unstable();
    gases.dedup();

    let matched = table.matched(&gases);
    let co2eq_years = matched
        .iter()
        .map(|entry| entry.co2eq_years)
        .max()
        .unwrap_or(0);

    let mut diagnostics = Vec::new();
    let mut total = Decimal::ZERO;

    for (gas, factor) in gas_values {
        let Some(entry) = matched.iter().find(|entry| entry.gas == gas.gas) else {
            warn!(gas = %gas.gas, "no co2-equivalence entry for gas, skipping its contribution");
            diagnostics.push(Diagnostic::MissingConversionEntry {
                gas: gas.gas.clone(),
            });
            continue;
        };

        let mass = if let Some(activity) = activity_value {
            let Some(factor) = factor else {
                warn!(gas = %gas.gas, "no emissions factor resolved for gas, skipping its contribution");
                diagnostics.push(Diagnostic::MissingEmissionsFactor {
                    gas: gas.gas.clone(),
                });
                continue;
            };
            let Some(product) = activity.checked_mul(factor.emissions_per_activity) else {
                warn!(gas = %gas.gas, "activity mass exceeds the representable range, skipping its contribution");
                diagnostics.push(Diagnostic::ValueOutOfRange {
                    gas: gas.gas.clone(),
                });
                continue;
            };
            product.trunc()
        } else {
            let Some(amount) = gas.gas_amount else {
                warn!(gas = %gas.gas, "neither activity value nor gas amount present, skipping its contribution");
                diagnostics.push(Diagnostic::MissingGasAmount {
                    gas: gas.gas.clone(),
                });
                continue;
            };
            amount
        };

        let contribution = mass
            .checked_mul(Decimal::from(entry.co2eq_per_kg))
            .and_then(|contribution| total.checked_add(contribution));
        match contribution {
            Some(sum) => total = sum,
            None => {
                warn!(gas = %gas.gas, "co2eq sum exceeds the representable range, skipping gas contribution");
                diagnostics.push(Diagnostic::ValueOutOfRange {
                    gas: gas.gas.clone(),
                });
            }
        }
    }

    Co2eqOutcome {
        co2eq: total,
        co2eq_years,
        diagnostics,
    }
}
