use cityledger::config::{GwpOverride, apply_gwp_overrides};
use cityledger::model::{GwpTable, Inventory, SubCategory};
use cityledger::reconcile::{ReconciledState, reconcile};
use cityledger::store::SqliteLedger;
use cityledger::update::parse_update;
use rust_decimal_macros::dec;

fn open_ledger(dir: &std::path::Path) -> SqliteLedger {
    let db = dir.join("ledger.sqlite");
    let ledger = SqliteLedger::open(db.to_string_lossy().as_ref()).expect("open ledger");
    ledger.seed().expect("seed");
    ledger
}

fn set_value(
    ledger: &SqliteLedger,
    inventory: &Inventory,
    sub_category: &SubCategory,
    gwp: &GwpTable,
    payload: &str,
) -> ReconciledState {
    let update = parse_update(payload).expect("payload");
    let state = ledger
        .load_state(
            inventory.inventory_id,
            sub_category.subcategory_id,
            &update.referenced_factor_ids(),
        )
        .expect("load state");
    let result = reconcile(&state, &update, gwp);
    ledger.apply(&result).expect("apply");
    result
}

#[test]
fn inline_factor_is_updated_in_place_across_passes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = open_ledger(temp.path());
    let inventory = ledger
        .create_inventory("Test City 2025", 2025)
        .expect("inventory");
    let sub_category = ledger
        .sub_category_by_reference("I.1.2")
        .expect("catalogue query")
        .expect("seeded reference");
    let gwp = ledger.gwp_table().expect("gwp table");

    let first = set_value(
        &ledger,
        &inventory,
        &sub_category,
        &gwp,
        r#"{
            "activityValue": 100,
            "gasValues": [{
                "gas": "CO2",
                "emissionsFactor": {"emissionsPerActivity": 2, "gas": "CO2", "units": "kg/kWh"}
            }]
        }"#,
    );
    assert_eq!(first.inventory_value.co2eq, Some(dec!(200)));
    assert_eq!(first.factor_upserts.len(), 1);
    let factor_id = first.factor_upserts[0].emissions_factor_id;

    // Same gas, new factor data: the inventory-scoped factor is rewritten
    // under its existing id rather than replaced.
    let second = set_value(
        &ledger,
        &inventory,
        &sub_category,
        &gwp,
        r#"{
            "gasValues": [{
                "gas": "CO2",
                "emissionsFactor": {"emissionsPerActivity": 3, "gas": "CO2", "units": "kg/kWh"}
            }]
        }"#,
    );
    assert_eq!(second.factor_upserts.len(), 1);
    assert_eq!(second.factor_upserts[0].emissions_factor_id, factor_id);
    assert_eq!(second.inventory_value.co2eq, Some(dec!(300)));

    let state = ledger
        .load_state(inventory.inventory_id, sub_category.subcategory_id, &[])
        .expect("reload");
    assert_eq!(state.factors.len(), 1);
    assert_eq!(state.factors[0].emissions_per_activity, dec!(3));
    assert_eq!(
        state.value.and_then(|value| value.co2eq),
        Some(dec!(300))
    );
}

#[test]
fn explicit_factor_reference_is_preloaded_and_bound() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = open_ledger(temp.path());
    let inventory = ledger
        .create_inventory("Test City 2025", 2025)
        .expect("inventory");
    let sub_category = ledger
        .sub_category_by_reference("II.1.1")
        .expect("catalogue query")
        .expect("seeded reference");
    let gwp = ledger.gwp_table().expect("gwp table");

    // Mint an inventory-scoped factor through one line item, then bind a
    // second line item to it by id.
    let minted = set_value(
        &ledger,
        &inventory,
        &sub_category,
        &gwp,
        r#"{
            "activityValue": 10,
            "gasValues": [{
                "gas": "CO2",
                "emissionsFactor": {"emissionsPerActivity": 4, "gas": "CO2", "units": "kg/vkm"}
            }]
        }"#,
    );
    let factor_id = minted.factor_upserts[0].emissions_factor_id;

    let other = ledger
        .sub_category_by_reference("II.1.2")
        .expect("catalogue query")
        .expect("seeded reference");
    let result = set_value(
        &ledger,
        &inventory,
        &other,
        &gwp,
        &format!(
            r#"{{
                "activityValue": 5,
                "gasValues": [{{"gas": "CO2", "emissionsFactorId": "{factor_id}"}}]
            }}"#
        ),
    );
    assert_eq!(result.inventory_value.co2eq, Some(dec!(20)));
    assert_eq!(result.gas_values[0].emissions_factor_id, Some(factor_id));
    assert!(result.factor_upserts.is_empty());

    let total = ledger
        .inventory_total(inventory.inventory_id)
        .expect("total");
    assert_eq!(total, dec!(60));
}

#[test]
fn clearing_the_activity_value_persists_and_recomputes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = open_ledger(temp.path());
    let inventory = ledger
        .create_inventory("Test City 2025", 2025)
        .expect("inventory");
    let sub_category = ledger
        .sub_category_by_reference("III.1.2")
        .expect("catalogue query")
        .expect("seeded reference");
    let gwp = ledger.gwp_table().expect("gwp table");

    set_value(
        &ledger,
        &inventory,
        &sub_category,
        &gwp,
        r#"{
            "activityValue": 8,
            "gasValues": [{
                "gas": "CH4",
                "gasAmount": 500,
                "emissionsFactor": {"emissionsPerActivity": 1, "gas": "CH4", "units": "t/t"}
            }]
        }"#,
    );

    let cleared = set_value(
        &ledger,
        &inventory,
        &sub_category,
        &gwp,
        r#"{"activityValue": null}"#,
    );
    assert_eq!(cleared.inventory_value.activity_value, None);
    // Back to the direct amount: 500 * 28.
    assert_eq!(cleared.inventory_value.co2eq, Some(dec!(14000)));

    let state = ledger
        .load_state(inventory.inventory_id, sub_category.subcategory_id, &[])
        .expect("reload");
    let value = state.value.expect("persisted value");
    assert_eq!(value.activity_value, None);
    assert_eq!(value.co2eq, Some(dec!(14000)));
}

#[test]
fn overridden_table_feeds_the_computation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = open_ledger(temp.path());
    let inventory = ledger
        .create_inventory("Test City 2025", 2025)
        .expect("inventory");
    let sub_category = ledger
        .sub_category_by_reference("I.1.1")
        .expect("catalogue query")
        .expect("seeded reference");

    let gwp = apply_gwp_overrides(
        ledger.gwp_table().expect("gwp table"),
        &[GwpOverride {
            gas: "CH4".to_string(),
            co2eq_per_kg: 84,
            co2eq_years: 20,
        }],
    );

    let result = set_value(
        &ledger,
        &inventory,
        &sub_category,
        &gwp,
        r#"{"gasValues": [{"gas": "CH4", "gasAmount": 10}]}"#,
    );
    // Both horizons now match CH4: the 100-year row contributes, the
    // horizon is still the maximum over the matched rows.
    assert_eq!(result.inventory_value.co2eq, Some(dec!(280)));
    assert_eq!(result.inventory_value.co2eq_years, Some(100));
}
