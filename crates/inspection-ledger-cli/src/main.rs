use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use inspection_ledger_api::{
    InspectionLedgerApi, LedgerConfig, LedgerRequest, RecordFamily, API_CONTRACT_VERSION,
};
use inspection_ledger_core::{CollectionRouting, CompositeKey, OrganizationId, RecordFilter};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ledger")]
#[command(about = "Confidential inspection record ledger")]
struct Cli {
    /// YAML configuration file; flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    routing: Option<RoutingArg>,

    /// Membership identifier of the calling organization, e.g. `ManufacturerMSP`.
    #[arg(long, global = true)]
    msp_id: Option<String>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    /// AI composite-defect inspections.
    Defect {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    /// Blade chord-measurement inspections.
    Blade {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoutingArg {
    PerOrganization,
    SharedOnly,
}

impl From<RoutingArg> for CollectionRouting {
    fn from(value: RoutingArg) -> Self {
        match value {
            RoutingArg::PerOrganization => Self::PerOrganization,
            RoutingArg::SharedOnly => Self::SharedOnly,
        }
    }
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
    Init,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(AddArgs),
    Get(KeyArgs),
    GetPublic(KeyArgs),
    GetPrivate(KeyArgs),
    List,
    FilterConfidence(ConfidenceArgs),
    FilterPart(PartArgs),
    FilterOccasion(OccasionArgs),
    History(KeyArgs),
    Exists(KeyArgs),
    Count,
    VerifyHash(VerifyHashArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    /// File holding the record JSON.
    #[arg(long, conflicts_with = "json", required_unless_present = "json")]
    file: Option<PathBuf>,
    /// Inline record JSON.
    #[arg(long)]
    json: Option<String>,
}

#[derive(Debug, Args)]
struct KeyArgs {
    #[arg(long)]
    part_number: String,
    #[arg(long)]
    serial_number: String,
}

#[derive(Debug, Args)]
struct ConfidenceArgs {
    #[arg(long)]
    min: f64,
}

#[derive(Debug, Args)]
struct PartArgs {
    #[arg(long)]
    part_number: String,
}

#[derive(Debug, Args)]
struct OccasionArgs {
    #[arg(long)]
    label: String,
}

#[derive(Debug, Args)]
struct VerifyHashArgs {
    #[command(flatten)]
    key: KeyArgs,
    /// Expected evidence hash.
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    hash: Option<String>,
    /// Evidence file; its SHA-256 hex digest is compared.
    #[arg(long)]
    file: Option<PathBuf>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{level}`"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .context("failed to initialize tracing subscriber")
}

fn load_config(cli: &Cli) -> Result<LedgerConfig> {
    let mut config = match &cli.config {
        Some(path) => LedgerConfig::from_file(path)?,
        None => LedgerConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db.clone_from(db);
    }
    if let Some(routing) = cli.routing {
        config.routing = routing.into();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    let api = InspectionLedgerApi::new(load_config(&cli)?);
    let caller = cli.msp_id.clone().map(OrganizationId::new);

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Defect { command } => {
            run_record(RecordFamily::DefectInspection, *command, &api, caller)
        }
        Command::Blade { command } => {
            run_record(RecordFamily::BladeInspection, *command, &api, caller)
        }
    }
}

fn run_db(command: DbCommand, api: &InspectionLedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_file": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
        DbCommand::Init => {
            let status = api.init_ledger()?;
            emit_json(serde_json::json!({
                "db": api.config().db,
                "routing": api.config().routing,
                "schema_version": status.current_version,
                "api_contract_version": API_CONTRACT_VERSION
            }))
        }
    }
}

fn run_record(
    family: RecordFamily,
    command: RecordCommand,
    api: &InspectionLedgerApi,
    caller: Option<OrganizationId>,
) -> Result<()> {
    let request = match command {
        RecordCommand::Add(args) => {
            let raw = match (args.file, args.json) {
                (Some(path), _) => fs::read_to_string(&path)
                    .with_context(|| format!("failed to read record file {}", path.display()))?,
                (None, Some(json)) => json,
                (None, None) => anyhow::bail!("either --file or --json is required"),
            };
            let record = serde_json::from_str(&raw).context("record is not valid JSON")?;
            LedgerRequest::AddRecord { record }
        }
        RecordCommand::Get(args) => LedgerRequest::GetRecord { key: args.key()? },
        RecordCommand::GetPublic(args) => LedgerRequest::GetRecordPublic { key: args.key()? },
        RecordCommand::GetPrivate(args) => LedgerRequest::GetRecordPrivate { key: args.key()? },
        RecordCommand::List => LedgerRequest::ListAll,
        RecordCommand::FilterConfidence(args) => LedgerRequest::Filter {
            filter: RecordFilter::by_confidence_threshold(args.min),
        },
        RecordCommand::FilterPart(args) => LedgerRequest::Filter {
            filter: RecordFilter::by_part_number(args.part_number),
        },
        RecordCommand::FilterOccasion(args) => LedgerRequest::Filter {
            filter: RecordFilter::by_occasion_label(args.label),
        },
        RecordCommand::History(args) => LedgerRequest::History { key: args.key()? },
        RecordCommand::Exists(args) => LedgerRequest::Exists { key: args.key()? },
        RecordCommand::Count => LedgerRequest::Count,
        RecordCommand::VerifyHash(args) => {
            let hash = match (args.hash, args.file) {
                (Some(hash), _) => hash,
                (None, Some(path)) => {
                    let bytes = fs::read(&path)
                        .with_context(|| format!("failed to read evidence file {}", path.display()))?;
                    sha256_hex(&bytes)
                }
                (None, None) => anyhow::bail!("either --hash or --file is required"),
            };
            LedgerRequest::VerifyEvidenceHash {
                key: args.key.key()?,
                hash,
            }
        }
    };

    emit_json(api.invoke(family, caller, request)?)
}

impl KeyArgs {
    fn key(&self) -> Result<CompositeKey> {
        Ok(CompositeKey::new(&self.part_number, &self.serial_number)?)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
