use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use cityledger::config::{apply_gwp_overrides, default_config_yaml, load_effective_config};
use cityledger::model::{DataSource, GasValue, Inventory, InventoryValue, SubCategory};
use cityledger::reconcile::{SourceOutcome, reconcile};
use cityledger::store::{SqliteLedger, StoreError};
use cityledger::update::{ValidationError, parse_update};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DB_FILE: &str = "ledger.sqlite";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        let code = match &value {
            StoreError::NotFound { .. } => "not_found",
            StoreError::Sqlite(_) => "sqlite_error",
            StoreError::Corrupt { .. } => "corrupt_row",
        };
        Self::new(code, value.to_string())
    }
}

impl From<ValidationError> for CliError {
    fn from(value: ValidationError) -> Self {
        Self::new("validation_error", value.to_string())
    }
}

impl From<cityledger::config::ConfigError> for CliError {
    fn from(value: cityledger::config::ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "cityledger")]
#[command(about = "A local-first greenhouse-gas inventory ledger for cities")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    NewInventory(NewInventoryArgs),
    Inventories,
    Set(SetArgs),
    Show(ValueArgs),
    Delete(ValueArgs),
    Total(TotalArgs),
    Gases,
}

#[derive(Args, Debug)]
struct NewInventoryArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    year: i32,
}

#[derive(Args, Debug)]
struct SetArgs {
    inventory: String,
    subcategory: String,
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    stdin: bool,
}

#[derive(Args, Debug)]
struct ValueArgs {
    inventory: String,
    subcategory: String,
}

#[derive(Args, Debug)]
struct TotalArgs {
    inventory: String,
}

#[derive(Debug, Clone)]
struct LedgerPaths {
    root: PathBuf,
    db: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
    mode: StorageMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    RepoLocal,
    Global,
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = ledger_paths(&cwd, cli.global)?;
    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::NewInventory(args) => cmd_new_inventory(&paths, args),
        Command::Inventories => cmd_inventories(&paths),
        Command::Set(args) => cmd_set(&paths, args),
        Command::Show(args) => cmd_show(&paths, args),
        Command::Delete(args) => cmd_delete(&paths, args),
        Command::Total(args) => cmd_total(&paths, args),
        Command::Gases => cmd_gases(&paths),
    }
}

fn cmd_init(paths: &LedgerPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    let ledger = SqliteLedger::open(&path_string(&paths.db))?;
    ledger.seed()?;
    write_default_config(paths)?;

    print_json(&json!({
        "status": "ok",
        "ledger_dir": paths.root,
        "db": paths.db,
        "mode": match paths.mode {
            StorageMode::RepoLocal => "repo",
            StorageMode::Global => "global",
        },
    }))
}

fn cmd_new_inventory(paths: &LedgerPaths, args: NewInventoryArgs) -> Result<(), CliError> {
    let ledger = open_ledger(paths)?;
    let inventory = ledger.create_inventory(&args.name, args.year)?;
    print_json(&json!({
        "status": "ok",
        "inventory": inventory,
    }))
}

fn cmd_inventories(paths: &LedgerPaths) -> Result<(), CliError> {
    let ledger = open_ledger(paths)?;
    let inventories = ledger.inventories()?;
    print_json(&json!({ "inventories": inventories }))
}

fn cmd_set(paths: &LedgerPaths, args: SetArgs) -> Result<(), CliError> {
    let payload = read_payload(&args)?;
    let update = parse_update(&payload)?;

    let ledger = open_ledger(paths)?;
    let inventory = resolve_inventory(&ledger, &args.inventory)?;
    let sub_category = resolve_sub_category(&ledger, &args.subcategory)?;
    let state = ledger.load_state(
        inventory.inventory_id,
        sub_category.subcategory_id,
        &update.referenced_factor_ids(),
    )?;

    let config = load_effective_config(Some(&paths.repo_config), Some(&paths.user_config))?;
    let gwp = apply_gwp_overrides(ledger.gwp_table()?, &config.gwp);

    let result = reconcile(&state, &update, &gwp);
    ledger.apply(&result)?;

    let data_source = match &result.source {
        SourceOutcome::Unchanged(_) => state.data_source.clone(),
        SourceOutcome::Updated(source) | SourceOutcome::Created(source) => Some(source.clone()),
    };
    print_json(&json!({
        "data": value_payload(&result.inventory_value, &result.gas_values, data_source.as_ref())?,
        "diagnostics": result.diagnostics,
    }))
}

fn cmd_show(paths: &LedgerPaths, args: ValueArgs) -> Result<(), CliError> {
    let ledger = open_ledger(paths)?;
    let inventory = resolve_inventory(&ledger, &args.inventory)?;
    let sub_category = resolve_sub_category(&ledger, &args.subcategory)?;
    let state = ledger.load_state(inventory.inventory_id, sub_category.subcategory_id, &[])?;

    let Some(value) = &state.value else {
        return Err(CliError::new(
            "not_found",
            format!(
                "no inventory value for {} in inventory `{}`",
                sub_category.reference_number, inventory.inventory_name
            ),
        ));
    };
    print_json(&json!({
        "data": value_payload(value, &state.gas_values, state.data_source.as_ref())?,
    }))
}

fn cmd_delete(paths: &LedgerPaths, args: ValueArgs) -> Result<(), CliError> {
    let ledger = open_ledger(paths)?;
    let inventory = resolve_inventory(&ledger, &args.inventory)?;
    let sub_category = resolve_sub_category(&ledger, &args.subcategory)?;
    let value = ledger.delete_value(inventory.inventory_id, sub_category.subcategory_id)?;
    print_json(&json!({
        "data": value,
        "deleted": true,
    }))
}

fn cmd_total(paths: &LedgerPaths, args: TotalArgs) -> Result<(), CliError> {
    let ledger = open_ledger(paths)?;
    let inventory = resolve_inventory(&ledger, &args.inventory)?;
    let total = ledger.inventory_total(inventory.inventory_id)?;
    print_json(&json!({
        "data": {
            "inventory": inventory,
            "totalEmissions": total.to_string(),
        }
    }))
}

fn cmd_gases(paths: &LedgerPaths) -> Result<(), CliError> {
    let ledger = open_ledger(paths)?;
    let config = load_effective_config(Some(&paths.repo_config), Some(&paths.user_config))?;
    let gwp = apply_gwp_overrides(ledger.gwp_table()?, &config.gwp);
    print_json(&json!({ "data": gwp.entries() }))
}

fn read_payload(args: &SetArgs) -> Result<String, CliError> {
    match (&args.file, args.stdin) {
        (Some(_), true) => Err(CliError::new(
            "invalid_set_args",
            "use either `cityledger set --file <path>` or `cityledger set --stdin`",
        )),
        (Some(path), false) => {
            fs::read_to_string(path).map_err(|err| CliError::io("read_error", err))
        }
        (None, true) => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|err| CliError::io("stdin_error", err))?;
            Ok(buf)
        }
        (None, false) => Err(CliError::new(
            "missing_set_payload",
            "expected --file <path> or --stdin",
        )),
    }
}

fn resolve_inventory(ledger: &SqliteLedger, selector: &str) -> Result<Inventory, CliError> {
    if let Ok(id) = Uuid::parse_str(selector) {
        return ledger.inventory_by_id(id)?.ok_or_else(|| {
            CliError::new("not_found", format!("inventory `{selector}` not found"))
        });
    }

    let mut named = ledger.inventories_named(selector)?;
    match named.len() {
        0 => Err(CliError::new(
            "not_found",
            format!("inventory `{selector}` not found"),
        )),
        1 => Ok(named.remove(0)),
        _ => Err(CliError::new(
            "ambiguous_inventory",
            format!(
                "inventory name `{selector}` matches {} inventories; use its id",
                named.len()
            ),
        )),
    }
}

fn resolve_sub_category(ledger: &SqliteLedger, selector: &str) -> Result<SubCategory, CliError> {
    let found = if let Ok(id) = Uuid::parse_str(selector) {
        ledger.sub_category_by_id(id)?
    } else {
        ledger.sub_category_by_reference(selector)?
    };
    found.ok_or_else(|| CliError::new("not_found", format!("sub-category `{selector}` not found")))
}

fn value_payload(
    value: &InventoryValue,
    gas_values: &[GasValue],
    data_source: Option<&DataSource>,
) -> Result<Value, CliError> {
    let mut payload = serde_json::to_value(value)?;
    if let Value::Object(object) = &mut payload {
        object.insert("gasValues".to_string(), serde_json::to_value(gas_values)?);
        object.insert("dataSource".to_string(), serde_json::to_value(data_source)?);
    }
    Ok(payload)
}

fn ledger_paths(cwd: &Path, global: bool) -> Result<LedgerPaths, CliError> {
    let home = home_dir()?;
    let (root, mode) = if global {
        (home.join(".cityledger"), StorageMode::Global)
    } else {
        (cwd.join(".cityledger"), StorageMode::RepoLocal)
    };

    Ok(LedgerPaths {
        db: root.join(DB_FILE),
        repo_config: cwd.join(".cityledger").join("config.yml"),
        user_config: home.join(".cityledger").join("config.yml"),
        root,
        mode,
    })
}

fn open_ledger(paths: &LedgerPaths) -> Result<SqliteLedger, CliError> {
    if !paths.root.exists() || !paths.db.exists() {
        return Err(CliError::new(
            "not_initialized",
            "ledger is not initialized; run `cityledger init`",
        ));
    }
    Ok(SqliteLedger::open(&path_string(&paths.db))?)
}

fn write_default_config(paths: &LedgerPaths) -> Result<(), CliError> {
    let config_path = match paths.mode {
        StorageMode::RepoLocal => &paths.repo_config,
        StorageMode::Global => &paths.user_config,
    };
    if config_path.exists() {
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    fs::write(config_path, default_config_yaml()).map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
