use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use inspection_ledger_core::{
    add_record, count, exists, filter_records, get_record, get_record_private, get_record_public,
    history, scan_all, verify_evidence_hash, BladeInspectionPublic, CollectionRouting,
    CompositeKey, DefectInspectionPublic, Invocation, LedgerError, OrganizationId, PublicRecord,
    RecordFilter, StaticIdentity, StoreError,
};
use inspection_ledger_store_sqlite::{IntegrityReport, SchemaStatus, SqliteLedger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Runtime configuration shared by the CLI and the service.
///
/// ```yaml
/// db: ./inspection-ledger.sqlite3
/// routing: per_organization   # or shared_only
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub db: PathBuf,
    pub routing: CollectionRouting,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("./inspection-ledger.sqlite3"),
            routing: CollectionRouting::default(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid configuration.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `content` is not valid configuration YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("failed to parse ledger configuration")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RecordFamily {
    DefectInspection,
    BladeInspection,
}

impl RecordFamily {
    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            Self::DefectInspection => DefectInspectionPublic::NAMESPACE,
            Self::BladeInspection => BladeInspectionPublic::NAMESPACE,
        }
    }
}

impl FromStr for RecordFamily {
    type Err = LedgerError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "defect-inspection" | "defect" => Ok(Self::DefectInspection),
            "blade-inspection" | "blade" => Ok(Self::BladeInspection),
            other => Err(LedgerError::Validation(format!(
                "unknown record family `{other}`"
            ))),
        }
    }
}

/// One ledger operation against a record family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum LedgerRequest {
    AddRecord { record: Value },
    GetRecord { key: CompositeKey },
    GetRecordPublic { key: CompositeKey },
    GetRecordPrivate { key: CompositeKey },
    ListAll,
    Filter { filter: RecordFilter },
    History { key: CompositeKey },
    Exists { key: CompositeKey },
    Count,
    VerifyEvidenceHash { key: CompositeKey, hash: String },
}

impl LedgerRequest {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddRecord { .. } => "add_record",
            Self::GetRecord { .. } => "get_record",
            Self::GetRecordPublic { .. } => "get_record_public",
            Self::GetRecordPrivate { .. } => "get_record_private",
            Self::ListAll => "list_all",
            Self::Filter { .. } => "filter",
            Self::History { .. } => "history",
            Self::Exists { .. } => "exists",
            Self::Count => "count",
            Self::VerifyEvidenceHash { .. } => "verify_evidence_hash",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct InspectionLedgerApi {
    config: LedgerConfig,
}

impl InspectionLedgerApi {
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteLedger> {
        SqliteLedger::open(&self.config.db)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Prepare an empty ledger for use. Existing data is left untouched.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn init_ledger(&self) -> Result<SchemaStatus> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let status = store.schema_status()?;
        info!(
            db = %self.config.db.display(),
            routing = self.config.routing.as_str(),
            schema_version = status.current_version,
            "ledger initialized"
        );
        Ok(status)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_store()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when any integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Run `request` as one ledger invocation on behalf of `caller`. Successful
    /// invocations commit; failed ones leave the ledger untouched.
    ///
    /// A database without schema is migrated on first use; an up-to-date one
    /// is only inspected.
    ///
    /// Domain failures are returned as [`LedgerError`] inside the `anyhow`
    /// error and can be recovered with `downcast_ref`.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or the operation fails.
    pub fn invoke(
        &self,
        family: RecordFamily,
        caller: Option<OrganizationId>,
        request: LedgerRequest,
    ) -> Result<Value> {
        let mut store = self.open_store()?;
        let status = store.schema_status()?;
        if !status.pending_versions.is_empty() || status.inferred_from_legacy {
            debug!(
                current_version = status.current_version,
                target_version = status.target_version,
                "migrating ledger on first use"
            );
            store.migrate()?;
        }
        let mut invocation = store.begin(family.namespace())?;
        let identity = StaticIdentity::from_option(caller);
        let operation = request.name();

        let outcome = {
            let mut scoped = Invocation::new(&mut invocation, &identity, self.config.routing);
            match family {
                RecordFamily::DefectInspection => {
                    dispatch::<DefectInspectionPublic>(&mut scoped, request)
                }
                RecordFamily::BladeInspection => {
                    dispatch::<BladeInspectionPublic>(&mut scoped, request)
                }
            }
        };
        let value = outcome?;
        invocation.commit()?;
        debug!(namespace = family.namespace(), operation, "invocation completed");
        Ok(value)
    }
}

fn dispatch<P: PublicRecord>(
    invocation: &mut Invocation<'_>,
    request: LedgerRequest,
) -> std::result::Result<Value, LedgerError> {
    match request {
        LedgerRequest::AddRecord { record } => {
            let payload = serde_json::to_string(&record).map_err(encode_error)?;
            to_value(&add_record::<P>(invocation, &payload)?)
        }
        LedgerRequest::GetRecord { key } => to_value(&get_record::<P>(invocation, &key)?),
        LedgerRequest::GetRecordPublic { key } => {
            to_value(&get_record_public::<P>(invocation, &key)?)
        }
        LedgerRequest::GetRecordPrivate { key } => {
            to_value(&get_record_private::<P>(invocation, &key)?)
        }
        LedgerRequest::ListAll => {
            let records = scan_all::<P>(invocation)?.collect::<std::result::Result<Vec<_>, _>>()?;
            to_value(&records)
        }
        LedgerRequest::Filter { filter } => to_value(&filter_records::<P>(invocation, &filter)?),
        LedgerRequest::History { key } => {
            let versions =
                history::<P>(invocation, &key)?.collect::<std::result::Result<Vec<_>, _>>()?;
            to_value(&versions)
        }
        LedgerRequest::Exists { key } => Ok(json!({
            "key": key,
            "exists": exists(invocation, &key)?,
        })),
        LedgerRequest::Count => Ok(json!({ "count": count(invocation)? })),
        LedgerRequest::VerifyEvidenceHash { key, hash } => {
            let verified = verify_evidence_hash::<P>(invocation, &key, &hash)?;
            Ok(json!({
                "key": key,
                "hash": hash,
                "verified": verified,
            }))
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, LedgerError> {
    serde_json::to_value(value).map_err(encode_error)
}

fn encode_error(err: serde_json::Error) -> LedgerError {
    LedgerError::Store(StoreError::new(format!("failed to encode JSON: {err}")))
}
