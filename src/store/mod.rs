use chrono::Utc;
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;
use uuid::Uuid;

use crate::model::{
    DataSource, EmissionsFactor, GasValue, GwpEntry, GwpTable, Inventory, InventoryValue,
    InventoryValueState, SourceType, SubCategory,
};
use crate::reconcile::{ReconciledState, SourceOutcome};

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    NotFound { entity: &'static str, key: String },
    Corrupt { column: &'static str, message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::NotFound { entity, key } => write!(f, "{entity} `{key}` not found"),
            Self::Corrupt { column, message } => {
                write!(f, "stored value in `{column}` is unreadable: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

// IPCC AR5 100-year global warming potentials.
const GWP_SEED: &[(&str, i64, i32)] = &[("CO2", 1, 100), ("CH4", 28, 100), ("N2O", 265, 100)];

// Compact GPC catalogue subset: (id, sector id, name).
const SUB_SECTOR_SEED: &[(&str, &str, &str)] = &[
    (
        "a1b2c3d4-0e1f-4a2b-8c3d-5e6f7a8b9c0d",
        "f1d7a0e2-8c34-4b5d-9a6e-0c1b2d3e4f50",
        "Residential buildings",
    ),
    (
        "b2c3d4e5-1f2a-4b3c-9d4e-6f7a8b9c0d1e",
        "f1d7a0e2-8c34-4b5d-9a6e-0c1b2d3e4f50",
        "Commercial and institutional buildings and facilities",
    ),
    (
        "c3d4e5f6-2a3b-4c4d-8e5f-7a8b9c0d1e2f",
        "9b2c4d6e-1f3a-4c5b-8d7e-2a1b0c9d8e7f",
        "On-road transportation",
    ),
    (
        "d4e5f6a7-3b4c-4d5e-9f6a-8b9c0d1e2f3a",
        "3c5d7e9f-2b4a-4d6c-9e8f-1a0b9c8d7e6f",
        "Solid waste disposal",
    ),
];

// (id, sub-sector id, GPC reference number, name).
const SUB_CATEGORY_SEED: &[(&str, &str, &str, &str)] = &[
    (
        "e5f6a7b8-4c5d-4e6f-8a7b-9c0d1e2f3a4b",
        "a1b2c3d4-0e1f-4a2b-8c3d-5e6f7a8b9c0d",
        "I.1.1",
        "Emissions from fuel combustion within the city boundary",
    ),
    (
        "f6a7b8c9-5d6e-4f7a-9b8c-0d1e2f3a4b5c",
        "a1b2c3d4-0e1f-4a2b-8c3d-5e6f7a8b9c0d",
        "I.1.2",
        "Emissions from grid-supplied energy consumed within the city boundary",
    ),
    (
        "a7b8c9d0-6e7f-4a8b-8c9d-1e2f3a4b5c6d",
        "b2c3d4e5-1f2a-4b3c-9d4e-6f7a8b9c0d1e",
        "I.2.1",
        "Emissions from fuel combustion within the city boundary",
    ),
    (
        "b8c9d0e1-7f8a-4b9c-9d0e-2f3a4b5c6d7e",
        "b2c3d4e5-1f2a-4b3c-9d4e-6f7a8b9c0d1e",
        "I.2.2",
        "Emissions from grid-supplied energy consumed within the city boundary",
    ),
    (
        "c9d0e1f2-8a9b-4c0d-8e1f-3a4b5c6d7e8f",
        "c3d4e5f6-2a3b-4c4d-8e5f-7a8b9c0d1e2f",
        "II.1.1",
        "Emissions from on-road transportation occurring within the city boundary",
    ),
    (
        "d0e1f2a3-9b0c-4d1e-9f2a-4b5c6d7e8f9a",
        "c3d4e5f6-2a3b-4c4d-8e5f-7a8b9c0d1e2f",
        "II.1.2",
        "Emissions from grid-supplied energy consumed for on-road transportation",
    ),
    (
        "e1f2a3b4-0c1d-4e2f-8a3b-5c6d7e8f9a0b",
        "d4e5f6a7-3b4c-4d5e-9f6a-8b9c0d1e2f3a",
        "III.1.1",
        "Emissions from solid waste disposed within the city boundary",
    ),
    (
        "f2a3b4c5-1d2e-4f3a-9b4c-6d7e8f9a0b1c",
        "d4e5f6a7-3b4c-4d5e-9f6a-8b9c0d1e2f3a",
        "III.1.2",
        "Emissions from solid waste disposed outside the city boundary",
    ),
];

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn.execute_batch("PRAGMA user_version = 1;")?;
            }
            1 => self.create_schema_v1()?,
            _ => return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery)),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS inventory (
                inventory_id TEXT PRIMARY KEY,
                inventory_name TEXT NOT NULL,
                year INTEGER NOT NULL,
                created TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                UNIQUE(inventory_name, year)
            );

            CREATE TABLE IF NOT EXISTS sub_sector (
                subsector_id TEXT PRIMARY KEY,
                sector_id TEXT NOT NULL,
                subsector_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sub_category (
                subcategory_id TEXT PRIMARY KEY,
                subsector_id TEXT NOT NULL REFERENCES sub_sector(subsector_id),
                reference_number TEXT NOT NULL UNIQUE,
                subcategory_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS data_source (
                datasource_id TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                data_quality TEXT,
                notes TEXT,
                created TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS emissions_factor (
                emissions_factor_id TEXT PRIMARY KEY,
                gas TEXT NOT NULL,
                units TEXT NOT NULL,
                emissions_per_activity TEXT NOT NULL,
                inventory_id TEXT REFERENCES inventory(inventory_id),
                created TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inventory_value (
                id TEXT PRIMARY KEY,
                inventory_id TEXT NOT NULL REFERENCES inventory(inventory_id),
                sector_id TEXT,
                sub_sector_id TEXT,
                sub_category_id TEXT NOT NULL REFERENCES sub_category(subcategory_id),
                gpc_reference_number TEXT,
                activity_value TEXT,
                activity_units TEXT,
                co2eq TEXT,
                co2eq_years INTEGER,
                unavailable_reason TEXT,
                unavailable_explanation TEXT,
                datasource_id TEXT REFERENCES data_source(datasource_id),
                created TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                UNIQUE(inventory_id, sub_category_id)
            );

            CREATE INDEX IF NOT EXISTS idx_inventory_value_inventory
                ON inventory_value(inventory_id);

            CREATE TABLE IF NOT EXISTS gas_value (
                gas_value_id TEXT PRIMARY KEY,
                inventory_value_id TEXT NOT NULL
                    REFERENCES inventory_value(id) ON DELETE CASCADE,
                gas TEXT NOT NULL,
                gas_amount TEXT,
                emissions_factor_id TEXT REFERENCES emissions_factor(emissions_factor_id),
                UNIQUE(inventory_value_id, gas)
            );

            CREATE INDEX IF NOT EXISTS idx_gas_value_parent
                ON gas_value(inventory_value_id);

            CREATE TABLE IF NOT EXISTS gas_to_co2eq (
                gas TEXT NOT NULL,
                co2eq_per_kg INTEGER NOT NULL,
                co2eq_years INTEGER NOT NULL,
                UNIQUE(gas, co2eq_years)
            );
            ",
        )
    }

    /// Seed the GPC catalogue subset and the AR5 CO2-equivalence rows.
    /// Re-running is a no-op for rows that already exist.
    pub fn seed(&self) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        for (id, sector_id, name) in SUB_SECTOR_SEED {
            tx.execute(
                "INSERT OR IGNORE INTO sub_sector (subsector_id, sector_id, subsector_name)
                 VALUES (?1, ?2, ?3)",
                params![id, sector_id, name],
            )?;
        }
        for (id, subsector_id, reference, name) in SUB_CATEGORY_SEED {
            tx.execute(
                "INSERT OR IGNORE INTO sub_category
                     (subcategory_id, subsector_id, reference_number, subcategory_name)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, subsector_id, reference, name],
            )?;
        }
        for (gas, per_kg, years) in GWP_SEED {
            tx.execute(
                "INSERT OR IGNORE INTO gas_to_co2eq (gas, co2eq_per_kg, co2eq_years)
                 VALUES (?1, ?2, ?3)",
                params![gas, per_kg, years],
            )?;
        }
        tx.commit()?;
        info!(
            sub_categories = SUB_CATEGORY_SEED.len(),
            gwp_rows = GWP_SEED.len(),
            "seeded catalogue and co2-equivalence table"
        );
        Ok(())
    }

    pub fn create_inventory(&self, name: &str, year: i32) -> Result<Inventory, StoreError> {
        let inventory = Inventory {
            inventory_id: Uuid::new_v4(),
            inventory_name: name.to_string(),
            year,
        };
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO inventory (inventory_id, inventory_name, year, created, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                inventory.inventory_id.to_string(),
                inventory.inventory_name,
                inventory.year,
                now
            ],
        )?;
        Ok(inventory)
    }

    pub fn inventories(&self) -> Result<Vec<Inventory>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT inventory_id, inventory_name, year FROM inventory
             ORDER BY year DESC, inventory_name ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            out.push(Inventory {
                inventory_id: decode_uuid(&id, "inventory_id")?,
                inventory_name: row.get(1)?,
                year: row.get(2)?,
            });
        }
        Ok(out)
    }

    pub fn inventory_by_id(&self, id: Uuid) -> Result<Option<Inventory>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT inventory_name, year FROM inventory WHERE inventory_id = ?1",
                params![id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(inventory_name, year)| Inventory {
            inventory_id: id,
            inventory_name,
            year,
        }))
    }

    pub fn inventories_named(&self, name: &str) -> Result<Vec<Inventory>, StoreError> {
        Ok(self
            .inventories()?
            .into_iter()
            .filter(|inventory| inventory.inventory_name == name)
            .collect())
    }

    pub fn sub_category_by_id(&self, id: Uuid) -> Result<Option<SubCategory>, StoreError> {
        self.sub_category_where("sc.subcategory_id = ?1", &id.to_string())
    }

    pub fn sub_category_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<SubCategory>, StoreError> {
        self.sub_category_where("sc.reference_number = ?1", reference)
    }

    fn sub_category_where(
        &self,
        predicate: &str,
        key: &str,
    ) -> Result<Option<SubCategory>, StoreError> {
        let sql = format!(
            "SELECT sc.subcategory_id, sc.subsector_id, ss.sector_id,
                    sc.reference_number, sc.subcategory_name
             FROM sub_category sc
             JOIN sub_sector ss ON ss.subsector_id = sc.subsector_id
             WHERE {predicate}"
        );
        let row = self
            .conn
            .query_row(&sql, params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;
        let Some((subcategory_id, subsector_id, sector_id, reference_number, name)) = row else {
            return Ok(None);
        };
        Ok(Some(SubCategory {
            subcategory_id: decode_uuid(&subcategory_id, "subcategory_id")?,
            subsector_id: decode_uuid(&subsector_id, "subsector_id")?,
            sector_id: decode_uuid(&sector_id, "sector_id")?,
            reference_number,
            subcategory_name: name,
        }))
    }

    pub fn gwp_table(&self) -> Result<GwpTable, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT gas, co2eq_per_kg, co2eq_years FROM gas_to_co2eq
             ORDER BY gas ASC, co2eq_years DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(GwpEntry {
                gas: row.get(0)?,
                co2eq_per_kg: row.get(1)?,
                co2eq_years: row.get(2)?,
            });
        }
        Ok(GwpTable::new(entries))
    }

    /// Load the consistent snapshot one reconciliation pass operates on.
    /// Fails not-found (before any mutation) when the inventory, the
    /// sub-category, or a factor the update references does not exist.
    pub fn load_state(
        &self,
        inventory_id: Uuid,
        subcategory_id: Uuid,
        referenced_factors: &[Uuid],
    ) -> Result<InventoryValueState, StoreError> {
        if self.inventory_by_id(inventory_id)?.is_none() {
            return Err(StoreError::NotFound {
                entity: "inventory",
                key: inventory_id.to_string(),
            });
        }
        let sub_category =
            self.sub_category_by_id(subcategory_id)?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "sub-category",
                    key: subcategory_id.to_string(),
                })?;

        let value = self.value_row(inventory_id, subcategory_id)?;
        let gas_values = match &value {
            Some(value) => self.gas_rows(value.id)?,
            None => Vec::new(),
        };
        let data_source = match value.as_ref().and_then(|value| value.datasource_id) {
            Some(id) => self.data_source_row(id)?,
            None => None,
        };

        let mut factor_ids = gas_values
            .iter()
            .filter_map(|gas| gas.emissions_factor_id)
            .chain(referenced_factors.iter().copied())
            .collect::<Vec<_>>();
        factor_ids.sort();
        factor_ids.dedup();

        let mut factors = Vec::with_capacity(factor_ids.len());
        for id in factor_ids {
            match self.factor_row(id)? {
                Some(factor) => factors.push(factor),
                None => {
                    return Err(StoreError::NotFound {
                        entity: "emissions factor",
                        key: id.to_string(),
                    });
                }
            }
        }

        Ok(InventoryValueState {
            inventory_id,
            sub_category,
            value,
            gas_values,
            data_source,
            factors,
        })
    }

    /// Persist one reconciliation result as a single transaction: the
    /// data-source outcome, factor upserts, gas-value deletes and
    /// upserts, and the line item itself. Any failure rolls the whole
    /// unit back.
    pub fn apply(&self, state: &ReconciledState) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_rfc3339();

        match &state.source {
            SourceOutcome::Unchanged(_) => {}
            SourceOutcome::Created(source) => {
                tx.execute(
                    "INSERT INTO data_source
                         (datasource_id, source_type, data_quality, notes, created, last_updated)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![
                        source.datasource_id.to_string(),
                        source.source_type.as_str(),
                        source.data_quality,
                        source.notes,
                        now
                    ],
                )?;
            }
            SourceOutcome::Updated(source) => {
                tx.execute(
                    "UPDATE data_source
                     SET source_type = ?2, data_quality = ?3, notes = ?4, last_updated = ?5
                     WHERE datasource_id = ?1",
                    params![
                        source.datasource_id.to_string(),
                        source.source_type.as_str(),
                        source.data_quality,
                        source.notes,
                        now
                    ],
                )?;
            }
        }

        for factor in &state.factor_upserts {
            tx.execute(
                "INSERT INTO emissions_factor
                     (emissions_factor_id, gas, units, emissions_per_activity,
                      inventory_id, created, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(emissions_factor_id) DO UPDATE SET
                     gas = excluded.gas,
                     units = excluded.units,
                     emissions_per_activity = excluded.emissions_per_activity,
                     last_updated = excluded.last_updated",
                params![
                    factor.emissions_factor_id.to_string(),
                    factor.gas,
                    factor.units,
                    factor.emissions_per_activity.to_string(),
                    factor.inventory_id.map(|id| id.to_string()),
                    now
                ],
            )?;
        }

        let value = &state.inventory_value;
        tx.execute(
            "INSERT INTO inventory_value
                 (id, inventory_id, sector_id, sub_sector_id, sub_category_id,
                  gpc_reference_number, activity_value, activity_units, co2eq, co2eq_years,
                  unavailable_reason, unavailable_explanation, datasource_id,
                  created, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
             ON CONFLICT(id) DO UPDATE SET
                 gpc_reference_number = excluded.gpc_reference_number,
                 activity_value = excluded.activity_value,
                 activity_units = excluded.activity_units,
                 co2eq = excluded.co2eq,
                 co2eq_years = excluded.co2eq_years,
                 unavailable_reason = excluded.unavailable_reason,
                 unavailable_explanation = excluded.unavailable_explanation,
                 datasource_id = excluded.datasource_id,
                 last_updated = excluded.last_updated",
            params![
                value.id.to_string(),
                value.inventory_id.to_string(),
                value.sector_id.map(|id| id.to_string()),
                value.sub_sector_id.map(|id| id.to_string()),
                value.sub_category_id.to_string(),
                value.gpc_reference_number,
                value.activity_value.map(|v| v.to_string()),
                value.activity_units,
                value.co2eq.map(|v| v.to_string()),
                value.co2eq_years,
                value.unavailable_reason,
                value.unavailable_explanation,
                value.datasource_id.map(|id| id.to_string()),
                now
            ],
        )?;

        for id in &state.deleted_gas_value_ids {
            tx.execute(
                "DELETE FROM gas_value WHERE gas_value_id = ?1",
                params![id.to_string()],
            )?;
        }
        for gas in &state.gas_values {
            tx.execute(
                "INSERT INTO gas_value
                     (gas_value_id, inventory_value_id, gas, gas_amount, emissions_factor_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(gas_value_id) DO UPDATE SET
                     gas = excluded.gas,
                     gas_amount = excluded.gas_amount,
                     emissions_factor_id = excluded.emissions_factor_id",
                params![
                    gas.gas_value_id.to_string(),
                    gas.inventory_value_id.to_string(),
                    gas.gas,
                    gas.gas_amount.map(|v| v.to_string()),
                    gas.emissions_factor_id.map(|id| id.to_string()),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a line item; its gas values cascade away with it.
    pub fn delete_value(
        &self,
        inventory_id: Uuid,
        subcategory_id: Uuid,
    ) -> Result<InventoryValue, StoreError> {
        let value = self
            .value_row(inventory_id, subcategory_id)?
            .ok_or_else(|| StoreError::NotFound {
                entity: "inventory value",
                key: format!("{inventory_id}/{subcategory_id}"),
            })?;
        self.conn.execute(
            "DELETE FROM inventory_value WHERE id = ?1",
            params![value.id.to_string()],
        )?;
        Ok(value)
    }

    /// Exact sum of co2eq over the inventory's line items.
    pub fn inventory_total(&self, inventory_id: Uuid) -> Result<Decimal, StoreError> {
        if self.inventory_by_id(inventory_id)?.is_none() {
            return Err(StoreError::NotFound {
                entity: "inventory",
                key: inventory_id.to_string(),
            });
        }
        let mut stmt = self.conn.prepare(
            "SELECT co2eq FROM inventory_value
             WHERE inventory_id = ?1 AND co2eq IS NOT NULL",
        )?;
        let mut rows = stmt.query(params![inventory_id.to_string()])?;
        let mut total = Decimal::ZERO;
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let co2eq = decode_decimal(&raw, "co2eq")?;
            total = total
                .checked_add(co2eq)
                .ok_or_else(|| StoreError::Corrupt {
                    column: "co2eq",
                    message: "inventory total exceeds the representable range".to_string(),
                })?;
        }
        Ok(total)
    }

    fn value_row(
        &self,
        inventory_id: Uuid,
        subcategory_id: Uuid,
    ) -> Result<Option<InventoryValue>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, sector_id, sub_sector_id, gpc_reference_number,
                        activity_value, activity_units, co2eq, co2eq_years,
                        unavailable_reason, unavailable_explanation, datasource_id
                 FROM inventory_value
                 WHERE inventory_id = ?1 AND sub_category_id = ?2",
                params![inventory_id.to_string(), subcategory_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<i32>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            sector_id,
            sub_sector_id,
            gpc_reference_number,
            activity_value,
            activity_units,
            co2eq,
            co2eq_years,
            unavailable_reason,
            unavailable_explanation,
            datasource_id,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(InventoryValue {
            id: decode_uuid(&id, "id")?,
            inventory_id,
            sector_id: decode_uuid_opt(sector_id, "sector_id")?,
            sub_sector_id: decode_uuid_opt(sub_sector_id, "sub_sector_id")?,
            sub_category_id: subcategory_id,
            gpc_reference_number,
            activity_value: decode_decimal_opt(activity_value, "activity_value")?,
            activity_units,
            co2eq: decode_decimal_opt(co2eq, "co2eq")?,
            co2eq_years,
            unavailable_reason,
            unavailable_explanation,
            datasource_id: decode_uuid_opt(datasource_id, "datasource_id")?,
        }))
    }

    fn gas_rows(&self, inventory_value_id: Uuid) -> Result<Vec<GasValue>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT gas_value_id, gas, gas_amount, emissions_factor_id
             FROM gas_value
             WHERE inventory_value_id = ?1
             ORDER BY gas ASC",
        )?;
        let mut rows = stmt.query(params![inventory_value_id.to_string()])?;
        let mut raw_rows = Vec::new();
        while let Some(row) = rows.next()? {
            raw_rows.push((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ));
        }

        let mut out = Vec::with_capacity(raw_rows.len());
        for (id, gas, gas_amount, emissions_factor_id) in raw_rows {
            out.push(GasValue {
                gas_value_id: decode_uuid(&id, "gas_value_id")?,
                inventory_value_id,
                gas,
                gas_amount: decode_decimal_opt(gas_amount, "gas_amount")?,
                emissions_factor_id: decode_uuid_opt(emissions_factor_id, "emissions_factor_id")?,
            });
        }
        Ok(out)
    }

    fn data_source_row(&self, id: Uuid) -> Result<Option<DataSource>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT source_type, data_quality, notes
                 FROM data_source WHERE datasource_id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(source_type, data_quality, notes)| DataSource {
            datasource_id: id,
            source_type: SourceType::decode(&source_type),
            data_quality,
            notes,
        }))
    }

    fn factor_row(&self, id: Uuid) -> Result<Option<EmissionsFactor>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT gas, units, emissions_per_activity, inventory_id
                 FROM emissions_factor WHERE emissions_factor_id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((gas, units, emissions_per_activity, inventory_id)) = row else {
            return Ok(None);
        };
        Ok(Some(EmissionsFactor {
            emissions_factor_id: id,
            gas,
            units,
            emissions_per_activity: decode_decimal(&emissions_per_activity, "emissions_per_activity")?,
            inventory_id: decode_uuid_opt(inventory_id, "inventory_id")?,
        }))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn decode_uuid(raw: &str, column: &'static str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Corrupt {
        column,
        message: err.to_string(),
    })
}

fn decode_uuid_opt(raw: Option<String>, column: &'static str) -> Result<Option<Uuid>, StoreError> {
    raw.map(|raw| decode_uuid(&raw, column)).transpose()
}

fn decode_decimal(raw: &str, column: &'static str) -> Result<Decimal, StoreError> {
    raw.parse::<Decimal>().map_err(|err| StoreError::Corrupt {
        column,
        message: err.to_string(),
    })
}

fn decode_decimal_opt(
    raw: Option<String>,
    column: &'static str,
) -> Result<Option<Decimal>, StoreError> {
    raw.map(|raw| decode_decimal(&raw, column)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::reconcile;
    use crate::update::parse_update;
    use rust_decimal_macros::dec;

    fn seeded_ledger() -> SqliteLedger {
        let ledger = SqliteLedger::open_in_memory().expect("in-memory sqlite");
        ledger.seed().expect("seed");
        ledger
    }

    fn subcategory(ledger: &SqliteLedger, reference: &str) -> SubCategory {
        ledger
            .sub_category_by_reference(reference)
            .expect("catalogue query")
            .expect("seeded reference")
    }

    fn set_value(
        ledger: &SqliteLedger,
        inventory: &Inventory,
        reference: &str,
        payload: &str,
    ) -> ReconciledState {
        let sub_category = subcategory(ledger, reference);
        let update = parse_update(payload).expect("payload");
        let state = ledger
            .load_state(
                inventory.inventory_id,
                sub_category.subcategory_id,
                &update.referenced_factor_ids(),
            )
            .expect("load state");
        let result = reconcile(&state, &update, &ledger.gwp_table().expect("gwp table"));
        ledger.apply(&result).expect("apply");
        result
    }

    #[test]
    fn seeds_catalogue_and_gwp_rows_idempotently() {
        let ledger = seeded_ledger();
        ledger.seed().expect("second seed");

        let table = ledger.gwp_table().expect("gwp table");
        assert_eq!(table.entries().len(), 3);
        assert!(
            ledger
                .sub_category_by_reference("I.1.1")
                .expect("query")
                .is_some()
        );
        assert!(
            ledger
                .sub_category_by_reference("IX.9.9")
                .expect("query")
                .is_none()
        );
    }

    #[test]
    fn load_state_rejects_unknown_inventory_and_subcategory() {
        let ledger = seeded_ledger();
        let sub_category = subcategory(&ledger, "I.1.1");

        let err = ledger
            .load_state(Uuid::new_v4(), sub_category.subcategory_id, &[])
            .expect_err("unknown inventory");
        assert!(matches!(err, StoreError::NotFound { entity: "inventory", .. }));

        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let err = ledger
            .load_state(inventory.inventory_id, Uuid::new_v4(), &[])
            .expect_err("unknown sub-category");
        assert!(matches!(err, StoreError::NotFound { entity: "sub-category", .. }));
    }

    #[test]
    fn load_state_rejects_unknown_referenced_factor() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let sub_category = subcategory(&ledger, "I.1.1");

        let err = ledger
            .load_state(
                inventory.inventory_id,
                sub_category.subcategory_id,
                &[Uuid::new_v4()],
            )
            .expect_err("unknown factor");
        assert!(matches!(err, StoreError::NotFound { entity: "emissions factor", .. }));
    }

    #[test]
    fn apply_then_reload_roundtrips_the_line_item() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let result = set_value(
            &ledger,
            &inventory,
            "I.1.1",
            r#"{
                "activityValue": 50,
                "activityUnits": "kWh",
                "gasValues": [{
                    "gas": "CO2",
                    "emissionsFactor": {"emissionsPerActivity": 2, "gas": "CO2", "units": "kg/kWh"}
                }],
                "dataSource": {"sourceType": "user", "dataQuality": "high", "notes": "metered"}
            }"#,
        );

        let sub_category = subcategory(&ledger, "I.1.1");
        let state = ledger
            .load_state(inventory.inventory_id, sub_category.subcategory_id, &[])
            .expect("reload");
        let value = state.value.expect("persisted value");
        assert_eq!(value.id, result.inventory_value.id);
        assert_eq!(value.co2eq, Some(dec!(100)));
        assert_eq!(value.co2eq_years, Some(100));
        assert_eq!(value.activity_value, Some(dec!(50)));
        assert_eq!(state.gas_values.len(), 1);
        assert_eq!(state.factors.len(), 1);
        assert_eq!(state.factors[0].inventory_id, Some(inventory.inventory_id));
        let source = state.data_source.expect("data source");
        assert_eq!(source.source_type, SourceType::User);
        assert_eq!(source.data_quality, Some("high".to_string()));
    }

    #[test]
    fn reapplying_the_same_update_is_stable() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let payload = r#"{"gasValues": [{"gas": "CH4", "gasAmount": 1000}]}"#;

        let first = set_value(&ledger, &inventory, "I.1.1", payload);
        let second = set_value(&ledger, &inventory, "I.1.1", payload);

        assert_eq!(first.inventory_value.id, second.inventory_value.id);
        assert_eq!(second.inventory_value.co2eq, Some(dec!(28000)));
        assert_eq!(
            first.gas_values[0].gas_value_id,
            second.gas_values[0].gas_value_id
        );

        let sub_category = subcategory(&ledger, "I.1.1");
        let state = ledger
            .load_state(inventory.inventory_id, sub_category.subcategory_id, &[])
            .expect("reload");
        assert_eq!(state.gas_values.len(), 1);
    }

    #[test]
    fn system_source_row_survives_reconciliation_untouched() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let sub_category = subcategory(&ledger, "I.1.1");

        // Install a line item bound to a system-provided source, the way
        // a catalogue connector would.
        let system = DataSource {
            datasource_id: Uuid::new_v4(),
            source_type: SourceType::System,
            data_quality: Some("high".to_string()),
            notes: Some("catalogue import".to_string()),
        };
        let value_id = Uuid::new_v4();
        ledger
            .apply(&ReconciledState {
                inventory_value: InventoryValue {
                    id: value_id,
                    inventory_id: inventory.inventory_id,
                    sector_id: Some(sub_category.sector_id),
                    sub_sector_id: Some(sub_category.subsector_id),
                    sub_category_id: sub_category.subcategory_id,
                    gpc_reference_number: Some("I.1.1".to_string()),
                    activity_value: None,
                    activity_units: None,
                    co2eq: Some(dec!(500)),
                    co2eq_years: Some(100),
                    unavailable_reason: None,
                    unavailable_explanation: None,
                    datasource_id: Some(system.datasource_id),
                },
                gas_values: Vec::new(),
                deleted_gas_value_ids: Vec::new(),
                factor_upserts: Vec::new(),
                source: SourceOutcome::Created(system.clone()),
                diagnostics: Vec::new(),
            })
            .expect("seed system-backed value");

        set_value(
            &ledger,
            &inventory,
            "I.1.1",
            r#"{"dataSource": {"sourceType": "user", "dataQuality": "low", "notes": "edited"}}"#,
        );

        let original = ledger
            .data_source_row(system.datasource_id)
            .expect("query")
            .expect("row still present");
        assert_eq!(original, system);

        let state = ledger
            .load_state(inventory.inventory_id, sub_category.subcategory_id, &[])
            .expect("reload");
        let bound = state.data_source.expect("superseding source");
        assert_ne!(bound.datasource_id, system.datasource_id);
        assert_eq!(bound.source_type, SourceType::User);
        assert_eq!(bound.data_quality, Some("low".to_string()));
    }

    #[test]
    fn failed_apply_rolls_back_the_whole_unit() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let sub_category = subcategory(&ledger, "I.1.1");

        let source = DataSource {
            datasource_id: Uuid::new_v4(),
            source_type: SourceType::User,
            data_quality: None,
            notes: None,
        };
        let value_id = Uuid::new_v4();
        let bad = ReconciledState {
            inventory_value: InventoryValue {
                id: value_id,
                inventory_id: inventory.inventory_id,
                sector_id: Some(sub_category.sector_id),
                sub_sector_id: Some(sub_category.subsector_id),
                sub_category_id: sub_category.subcategory_id,
                gpc_reference_number: None,
                activity_value: None,
                activity_units: None,
                co2eq: Some(dec!(1)),
                co2eq_years: Some(100),
                unavailable_reason: None,
                unavailable_explanation: None,
                datasource_id: Some(source.datasource_id),
            },
            gas_values: vec![GasValue {
                gas_value_id: Uuid::new_v4(),
                inventory_value_id: value_id,
                gas: "CO2".to_string(),
                gas_amount: Some(dec!(1)),
                // dangling factor reference, rejected by the foreign key
                emissions_factor_id: Some(Uuid::new_v4()),
            }],
            deleted_gas_value_ids: Vec::new(),
            factor_upserts: Vec::new(),
            source: SourceOutcome::Created(source.clone()),
            diagnostics: Vec::new(),
        };

        assert!(ledger.apply(&bad).is_err());
        assert!(
            ledger
                .data_source_row(source.datasource_id)
                .expect("query after rollback")
                .is_none()
        );
        assert!(
            ledger
                .value_row(inventory.inventory_id, sub_category.subcategory_id)
                .expect("query after rollback")
                .is_none()
        );
    }

    #[test]
    fn delete_cascades_to_gas_values() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        set_value(
            &ledger,
            &inventory,
            "I.1.1",
            r#"{"gasValues": [{"gas": "CO2", "gasAmount": 10}, {"gas": "CH4", "gasAmount": 5}]}"#,
        );

        let sub_category = subcategory(&ledger, "I.1.1");
        let deleted = ledger
            .delete_value(inventory.inventory_id, sub_category.subcategory_id)
            .expect("delete");
        assert_eq!(deleted.co2eq, Some(dec!(150)));

        let remaining: i64 = ledger
            .conn
            .query_row("SELECT COUNT(*) FROM gas_value", [], |row| row.get(0))
            .expect("count");
        assert_eq!(remaining, 0);

        let err = ledger
            .delete_value(inventory.inventory_id, sub_category.subcategory_id)
            .expect_err("second delete");
        assert!(matches!(err, StoreError::NotFound { entity: "inventory value", .. }));
    }

    #[test]
    fn inventory_total_sums_line_items_exactly() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        let huge = Decimal::from(1_152_921_504_606_846_976_u64); // 2^60
        set_value(
            &ledger,
            &inventory,
            "I.1.1",
            &format!(r#"{{"gasValues": [{{"gas": "CO2", "gasAmount": {huge}}}]}}"#),
        );
        set_value(
            &ledger,
            &inventory,
            "II.1.1",
            r#"{"gasValues": [{"gas": "N2O", "gasAmount": 2}]}"#,
        );

        let total = ledger
            .inventory_total(inventory.inventory_id)
            .expect("total");
        assert_eq!(total, huge + dec!(530));
    }

    #[test]
    fn gas_removal_persists() {
        let ledger = seeded_ledger();
        let inventory = ledger.create_inventory("Test City 2025", 2025).expect("inventory");
        set_value(
            &ledger,
            &inventory,
            "III.1.1",
            r#"{"gasValues": [{"gas": "CO2", "gasAmount": 10}, {"gas": "CH4", "gasAmount": 5}]}"#,
        );
        set_value(
            &ledger,
            &inventory,
            "III.1.1",
            r#"{"gasValues": [{"gas": "CO2", "gasAmount": 10}]}"#,
        );

        let sub_category = subcategory(&ledger, "III.1.1");
        let state = ledger
            .load_state(inventory.inventory_id, sub_category.subcategory_id, &[])
            .expect("reload");
        assert_eq!(state.gas_values.len(), 1);
        assert_eq!(state.gas_values[0].gas, "CO2");
        assert_eq!(
            state.value.and_then(|value| value.co2eq),
            Some(dec!(10))
        );
    }
}
