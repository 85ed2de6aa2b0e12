use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod memory;
mod records;

pub use records::{
    BladeInspectionPublic, ChordMeasurements, DefectInspectionPublic, InspectorIdentity,
};

pub type DefectInspection = LogicalRecord<DefectInspectionPublic>;
pub type BladeInspection = LogicalRecord<BladeInspectionPublic>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown organization: {0}")]
    UnknownOrganization(OrganizationId),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a [`LedgerStore`] backend.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("store error: {message}")]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Membership identifier of the invoking organization, e.g. `ManufacturerMSP`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self(String::new())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OrganizationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<anonymous>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Membership {
    Manufacturer,
    MroLab,
    Unsupported(OrganizationId),
}

impl Membership {
    pub const MANUFACTURER_MSP: &'static str = "ManufacturerMSP";
    pub const MRO_LAB_MSP: &'static str = "MROLabMSP";

    #[must_use]
    pub fn of(organization: &OrganizationId) -> Self {
        match organization.as_str() {
            Self::MANUFACTURER_MSP => Self::Manufacturer,
            Self::MRO_LAB_MSP => Self::MroLab,
            _ => Self::Unsupported(organization.clone()),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::UnknownOrganization`] for memberships without a
    /// private collection.
    pub fn private_collection(&self) -> Result<CollectionName, LedgerError> {
        match self {
            Self::Manufacturer => Ok(CollectionName::new(CollectionName::MANUFACTURER)),
            Self::MroLab => Ok(CollectionName::new(CollectionName::MRO_LAB)),
            Self::Unsupported(organization) => {
                Err(LedgerError::UnknownOrganization(organization.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    pub const MANUFACTURER: &'static str = "private-manufacturer";
    pub const MRO_LAB: &'static str = "private-lab";
    pub const SHARED: &'static str = "shared";

    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn shared() -> Self {
        Self::new(Self::SHARED)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CollectionName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How callers are mapped onto private collections.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CollectionRouting {
    /// Each supported organization owns its own collection.
    #[default]
    PerOrganization,
    /// Every organization reads and writes one collection.
    SharedOnly,
}

impl CollectionRouting {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerOrganization => "per_organization",
            Self::SharedOnly => "shared_only",
        }
    }

    /// # Errors
    /// Returns [`LedgerError::UnknownOrganization`] when per-organization
    /// routing has no collection for `organization`.
    pub fn resolve(self, organization: &OrganizationId) -> Result<CollectionName, LedgerError> {
        match self {
            Self::PerOrganization => Membership::of(organization).private_collection(),
            Self::SharedOnly => Ok(CollectionName::shared()),
        }
    }
}

/// Storage key of a logical record: `{partNumber}_{serialNumber}`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct CompositeKey {
    raw: String,
    separator: usize,
}

impl CompositeKey {
    pub const SEPARATOR: char = '_';

    /// # Errors
    /// Returns [`LedgerError::Validation`] when either half is blank or the part
    /// number contains the separator.
    pub fn new(part_number: &str, serial_number: &str) -> Result<Self, LedgerError> {
        if part_number.trim().is_empty() {
            return Err(LedgerError::Validation(
                "partNumber MUST be provided".to_string(),
            ));
        }
        if serial_number.trim().is_empty() {
            return Err(LedgerError::Validation(
                "serialNumber MUST be provided".to_string(),
            ));
        }
        if part_number.contains(Self::SEPARATOR) {
            return Err(LedgerError::Validation(format!(
                "partNumber MUST NOT contain '{}'",
                Self::SEPARATOR
            )));
        }
        Ok(Self {
            raw: format!("{part_number}{}{serial_number}", Self::SEPARATOR),
            separator: part_number.len(),
        })
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] when `raw` is not a well-formed key.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let Some((part_number, serial_number)) = raw.split_once(Self::SEPARATOR) else {
            return Err(LedgerError::Validation(format!(
                "key `{raw}` is missing the '{}' separator",
                Self::SEPARATOR
            )));
        };
        Self::new(part_number, serial_number)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn part_number(&self) -> &str {
        &self.raw[..self.separator]
    }

    #[must_use]
    pub fn serial_number(&self) -> &str {
        &self.raw[self.separator + 1..]
    }
}

impl Display for CompositeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for CompositeKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CompositeKey> for String {
    fn from(value: CompositeKey) -> Self {
        value.raw
    }
}

/// Commit time of a transaction as reported by the ledger.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxTimestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl TxTimestamp {
    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        Self {
            seconds: value.unix_timestamp(),
            nanos: value.nanosecond(),
        }
    }

    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// RFC 3339 rendering in UTC at whole-second precision.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when `seconds` is outside the supported range.
    pub fn to_rfc3339(self) -> Result<String, LedgerError> {
        let datetime = OffsetDateTime::from_unix_timestamp(self.seconds).map_err(|err| {
            StoreError::new(format!(
                "transaction timestamp {} is out of range: {err}",
                self.seconds
            ))
        })?;
        datetime.format(&Rfc3339).map_err(|err| {
            LedgerError::Store(StoreError::new(format!(
                "failed to format transaction timestamp: {err}"
            )))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TxProvenance {
    pub tx_id: String,
    pub timestamp: TxTimestamp,
}

impl TxProvenance {
    /// # Errors
    /// Returns an error when the timestamp cannot be rendered.
    pub fn committed_at(&self) -> Result<String, LedgerError> {
        self.timestamp.to_rfc3339()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// One entry of a key's append-only modification log.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeyModification {
    pub tx_id: String,
    pub timestamp: TxTimestamp,
    pub is_delete: bool,
    pub value: Vec<u8>,
}

/// Field-equality query over the stored JSON documents, in CouchDB selector
/// shape: `{"selector": {"occasionLabel": "manual"}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Selector {
    pub selector: Map<String, Value>,
}

impl Selector {
    #[must_use]
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut selector = Map::new();
        selector.insert(field.into(), value.into());
        Self { selector }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.selector.iter()
    }

    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        self.selector
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

pub type KeyValueIter<'a> = Box<dyn Iterator<Item = Result<KeyValue, StoreError>> + 'a>;
pub type HistoryIter<'a> = Box<dyn Iterator<Item = Result<KeyModification, StoreError>> + 'a>;

/// Ledger state visible to one invocation.
///
/// Writes are buffered by the backend and become durable only when the
/// surrounding invocation commits.
pub trait LedgerStore {
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn get_public(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn put_public(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn get_private(
        &self,
        collection: &CollectionName,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn put_private(
        &mut self,
        collection: &CollectionName,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError>;

    /// Keys in `[start, end)` in ascending order. Empty bounds are open.
    ///
    /// # Errors
    /// Returns an error when the scan cannot be started.
    fn range_scan(&self, start: &str, end: &str) -> Result<KeyValueIter<'_>, StoreError>;

    /// `Ok(None)` when the backend has no query pushdown.
    ///
    /// # Errors
    /// Returns an error when a supported query fails.
    fn rich_query(&self, _selector: &Selector) -> Result<Option<KeyValueIter<'_>>, StoreError> {
        Ok(None)
    }

    /// Modifications of `key` in commit order, deletions included.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read.
    fn history_of(&self, key: &str) -> Result<HistoryIter<'_>, StoreError>;

    fn tx_id(&self) -> &str;

    fn tx_timestamp(&self) -> TxTimestamp;
}

pub trait IdentityProvider {
    /// # Errors
    /// Returns [`LedgerError::UnknownOrganization`] when the caller carries no
    /// organization.
    fn caller_organization(&self) -> Result<OrganizationId, LedgerError>;
}

/// Identity fixed at construction time, as asserted by a CLI flag or header.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct StaticIdentity {
    organization: Option<OrganizationId>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: Some(OrganizationId::new(organization)),
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self { organization: None }
    }

    #[must_use]
    pub fn from_option(organization: Option<OrganizationId>) -> Self {
        Self {
            organization: organization.filter(|org| !org.as_str().trim().is_empty()),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn caller_organization(&self) -> Result<OrganizationId, LedgerError> {
        self.organization
            .clone()
            .ok_or_else(|| LedgerError::UnknownOrganization(OrganizationId::anonymous()))
    }
}

/// The ledger, caller identity and routing in effect for one invocation.
pub struct Invocation<'a> {
    store: &'a mut dyn LedgerStore,
    identity: &'a dyn IdentityProvider,
    routing: CollectionRouting,
}

impl<'a> Invocation<'a> {
    #[must_use]
    pub fn new(
        store: &'a mut dyn LedgerStore,
        identity: &'a dyn IdentityProvider,
        routing: CollectionRouting,
    ) -> Self {
        Self {
            store,
            identity,
            routing,
        }
    }

    #[must_use]
    pub fn store(&self) -> &dyn LedgerStore {
        &*self.store
    }

    #[must_use]
    pub fn routing(&self) -> CollectionRouting {
        self.routing
    }

    #[must_use]
    pub fn provenance(&self) -> TxProvenance {
        TxProvenance {
            tx_id: self.store.tx_id().to_string(),
            timestamp: self.store.tx_timestamp(),
        }
    }

    /// # Errors
    /// Returns [`LedgerError::UnknownOrganization`] when the caller cannot be
    /// mapped to a private collection.
    pub fn resolve_collection(&self) -> Result<(OrganizationId, CollectionName), LedgerError> {
        let organization = self.identity.caller_organization()?;
        let collection = self.routing.resolve(&organization)?;
        debug!(
            organization = %organization,
            collection = %collection,
            "resolved caller collection"
        );
        Ok((organization, collection))
    }

    fn reader_collection(&self) -> Option<CollectionName> {
        match self.resolve_collection() {
            Ok((_, collection)) => Some(collection),
            Err(err) => {
                warn!(error = %err, "serving public projection only");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub defect_detected: bool,
    pub confidence_score: f64,
}

/// The public half of a record family. Its associated `Private` type holds the
/// fields that are routed to the writer's private collection instead.
pub trait PublicRecord: Serialize + DeserializeOwned + Clone + Debug + PartialEq {
    type Private: Serialize + DeserializeOwned + Default + Clone + Debug + PartialEq;

    const NAMESPACE: &'static str;
    /// Stored field name of the occasion label, when the family has one.
    const OCCASION_FIELD: Option<&'static str> = None;

    fn part_number(&self) -> &str;

    fn serial_number(&self) -> &str;

    /// # Errors
    /// Returns [`LedgerError::Validation`] when the identifying fields are unusable.
    fn composite_key(&self) -> Result<CompositeKey, LedgerError> {
        CompositeKey::new(self.part_number(), self.serial_number())
    }

    /// Applies the server-side fields of a write.
    ///
    /// # Errors
    /// Returns an error when the transaction timestamp cannot be rendered.
    fn stamp_write(
        &mut self,
        provenance: &TxProvenance,
        organization: &OrganizationId,
    ) -> Result<(), LedgerError>;

    fn set_provenance(&mut self, tx_id: &str, committed_at: &str);

    fn evidence_hash(&self) -> &str;

    fn occasion_label(&self) -> Option<&str> {
        None
    }

    fn detection(&self) -> Option<Detection> {
        None
    }
}

/// A full record as submitted by clients and returned by merged reads. On the
/// wire both halves share one flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct LogicalRecord<P: PublicRecord> {
    #[serde(flatten)]
    pub public: P,
    #[serde(flatten)]
    pub private: P::Private,
}

impl<P: PublicRecord> LogicalRecord<P> {
    #[must_use]
    pub fn split(self) -> (P, P::Private) {
        (self.public, self.private)
    }

    /// A missing private half leaves the confidential fields at their defaults.
    #[must_use]
    pub fn merge(public: P, private: Option<P::Private>) -> Self {
        Self {
            public,
            private: private.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WriteReceipt {
    pub key: CompositeKey,
    pub tx_id: String,
    pub organization: OrganizationId,
    pub collection: CollectionName,
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, LedgerError> {
    serde_json::from_slice(bytes)
        .map_err(|err| LedgerError::Decode(format!("failed to decode {what}: {err}")))
}

fn encode_json<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec(value)
        .map_err(|err| StoreError::new(format!("failed to encode {what}: {err}")).into())
}

fn load_public<P: PublicRecord>(
    store: &dyn LedgerStore,
    key: &CompositeKey,
) -> Result<P, LedgerError> {
    let bytes = store
        .get_public(key.as_str())?
        .ok_or_else(|| LedgerError::NotFound(format!("record {key} does not exist")))?;
    decode_json(&bytes, "public sub-record")
}

fn load_private<P: PublicRecord>(
    store: &dyn LedgerStore,
    collection: &CollectionName,
    key: &CompositeKey,
) -> Result<Option<P::Private>, LedgerError> {
    store
        .get_private(collection, key.as_str())?
        .map(|bytes| decode_json(&bytes, "private sub-record"))
        .transpose()
}

/// Private half for a merged view. An undecodable entry is logged and treated
/// as absent so the public data stays readable.
fn merge_private<P: PublicRecord>(
    store: &dyn LedgerStore,
    collection: Option<&CollectionName>,
    key: &str,
) -> Result<Option<P::Private>, LedgerError> {
    let Some(collection) = collection else {
        return Ok(None);
    };
    let Some(bytes) = store.get_private(collection, key)? else {
        return Ok(None);
    };
    match decode_json::<P::Private>(&bytes, "private sub-record") {
        Ok(private) => Ok(Some(private)),
        Err(err) => {
            warn!(key, collection = %collection, error = %err, "ignoring malformed private half");
            Ok(None)
        }
    }
}

/// Splits `payload` and writes both halves in the current invocation. Nothing
/// is written unless the caller maps to a private collection.
///
/// # Errors
/// Returns [`LedgerError::Decode`] for malformed JSON,
/// [`LedgerError::UnknownOrganization`] for unroutable callers,
/// [`LedgerError::Validation`] for unusable keys, and store errors as-is.
pub fn add_record<P: PublicRecord>(
    invocation: &mut Invocation<'_>,
    payload: &str,
) -> Result<WriteReceipt, LedgerError> {
    let mut record: LogicalRecord<P> = serde_json::from_str(payload)
        .map_err(|err| LedgerError::Decode(format!("failed to parse record JSON: {err}")))?;
    let provenance = invocation.provenance();
    let (organization, collection) = invocation.resolve_collection()?;

    record.public.stamp_write(&provenance, &organization)?;
    let (public, private) = record.split();
    let key = public.composite_key()?;
    let public_bytes = encode_json(&public, "public sub-record")?;
    let private_bytes = encode_json(&private, "private sub-record")?;

    invocation.store.put_public(key.as_str(), &public_bytes)?;
    invocation
        .store
        .put_private(&collection, key.as_str(), &private_bytes)?;

    info!(
        namespace = P::NAMESPACE,
        key = %key,
        organization = %organization,
        collection = %collection,
        tx_id = %provenance.tx_id,
        "record written"
    );
    Ok(WriteReceipt {
        key,
        tx_id: provenance.tx_id,
        organization,
        collection,
    })
}

/// Merged read. Callers without a private collection get the public
/// projection with default confidential fields.
///
/// # Errors
/// Returns [`LedgerError::NotFound`] when no public half exists under `key`.
pub fn get_record<P: PublicRecord>(
    invocation: &Invocation<'_>,
    key: &CompositeKey,
) -> Result<LogicalRecord<P>, LedgerError> {
    let public = load_public::<P>(invocation.store(), key)?;
    let collection = invocation.reader_collection();
    let private = merge_private::<P>(invocation.store(), collection.as_ref(), key.as_str())?;
    let mut record = LogicalRecord::merge(public, private);
    let provenance = invocation.provenance();
    record
        .public
        .set_provenance(&provenance.tx_id, &provenance.committed_at()?);
    Ok(record)
}

/// # Errors
/// Returns [`LedgerError::NotFound`] when no public half exists under `key`.
pub fn get_record_public<P: PublicRecord>(
    invocation: &Invocation<'_>,
    key: &CompositeKey,
) -> Result<P, LedgerError> {
    let mut public = load_public::<P>(invocation.store(), key)?;
    let provenance = invocation.provenance();
    public.set_provenance(&provenance.tx_id, &provenance.committed_at()?);
    Ok(public)
}

/// Reads only the caller's own private half.
///
/// # Errors
/// Returns [`LedgerError::UnknownOrganization`] for unroutable callers and
/// [`LedgerError::NotFound`] when the caller's collection has no entry.
pub fn get_record_private<P: PublicRecord>(
    invocation: &Invocation<'_>,
    key: &CompositeKey,
) -> Result<P::Private, LedgerError> {
    let (_, collection) = invocation.resolve_collection()?;
    load_private::<P>(invocation.store(), &collection, key)?.ok_or_else(|| {
        LedgerError::NotFound(format!(
            "private data for record {key} does not exist in {collection}"
        ))
    })
}

/// Lazily merged records of one family. Entries with a malformed public half
/// are skipped with a warning; store failures end up in the stream.
pub struct RecordScan<'s, P: PublicRecord> {
    store: &'s dyn LedgerStore,
    entries: KeyValueIter<'s>,
    collection: Option<CollectionName>,
    tx_id: String,
    committed_at: String,
    _record: PhantomData<fn() -> P>,
}

impl<'s, P: PublicRecord> RecordScan<'s, P> {
    fn new(invocation: &'s Invocation<'_>, entries: KeyValueIter<'s>) -> Result<Self, LedgerError> {
        let provenance = invocation.provenance();
        Ok(Self {
            store: invocation.store(),
            entries,
            collection: invocation.reader_collection(),
            committed_at: provenance.committed_at()?,
            tx_id: provenance.tx_id,
            _record: PhantomData,
        })
    }

    fn merge_entry(&self, entry: &KeyValue) -> Result<Option<LogicalRecord<P>>, LedgerError> {
        let public = match decode_json::<P>(&entry.value, "public sub-record") {
            Ok(public) => public,
            Err(err) => {
                warn!(key = %entry.key, error = %err, "skipping malformed entry");
                return Ok(None);
            }
        };
        let private = merge_private::<P>(self.store, self.collection.as_ref(), &entry.key)?;
        let mut record = LogicalRecord::merge(public, private);
        record.public.set_provenance(&self.tx_id, &self.committed_at);
        Ok(Some(record))
    }
}

impl<P: PublicRecord> Iterator for RecordScan<'_, P> {
    type Item = Result<LogicalRecord<P>, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err.into())),
            };
            match self.merge_entry(&entry) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// # Errors
/// Returns an error when the range scan cannot be started.
pub fn scan_all<'s, P: PublicRecord>(
    invocation: &'s Invocation<'_>,
) -> Result<RecordScan<'s, P>, LedgerError> {
    let entries = invocation.store().range_scan("", "")?;
    RecordScan::new(invocation, entries)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordFilter {
    /// Defect detected with a confidence score of at least the threshold.
    ConfidenceAtLeast(f64),
    PartNumber(String),
    OccasionLabel(String),
}

impl RecordFilter {
    #[must_use]
    pub fn by_confidence_threshold(threshold: f64) -> Self {
        Self::ConfidenceAtLeast(threshold)
    }

    #[must_use]
    pub fn by_part_number(part_number: impl Into<String>) -> Self {
        Self::PartNumber(part_number.into())
    }

    #[must_use]
    pub fn by_occasion_label(label: impl Into<String>) -> Self {
        Self::OccasionLabel(label.into())
    }

    #[must_use]
    pub fn matches<P: PublicRecord>(&self, record: &LogicalRecord<P>) -> bool {
        match self {
            Self::ConfidenceAtLeast(threshold) => record
                .public
                .detection()
                .is_some_and(|d| d.defect_detected && d.confidence_score >= *threshold),
            Self::PartNumber(part_number) => record.public.part_number() == part_number,
            Self::OccasionLabel(label) => record.public.occasion_label() == Some(label.as_str()),
        }
    }

    /// Pushdown form of the filter, when the family stores the field.
    #[must_use]
    pub fn selector<P: PublicRecord>(&self) -> Option<Selector> {
        match self {
            Self::OccasionLabel(label) => {
                P::OCCASION_FIELD.map(|field| Selector::field_equals(field, label.clone()))
            }
            Self::ConfidenceAtLeast(_) | Self::PartNumber(_) => None,
        }
    }
}

/// # Errors
/// Returns the first store or provenance error encountered while scanning.
pub fn filter_records<P: PublicRecord>(
    invocation: &Invocation<'_>,
    filter: &RecordFilter,
) -> Result<Vec<LogicalRecord<P>>, LedgerError> {
    let pushed_down = match filter.selector::<P>() {
        Some(selector) => invocation.store().rich_query(&selector)?,
        None => None,
    };
    let scan = match pushed_down {
        Some(entries) => {
            debug!(namespace = P::NAMESPACE, "filter served by rich query");
            RecordScan::new(invocation, entries)?
        }
        None => scan_all(invocation)?,
    };

    let mut matched = Vec::new();
    for record in scan {
        let record = record?;
        if filter.matches(&record) {
            matched.push(record);
        }
    }
    Ok(matched)
}

/// Past public versions of a key, oldest first, each carrying the provenance
/// of the transaction that wrote it.
pub struct RecordHistory<'s, P: PublicRecord> {
    modifications: HistoryIter<'s>,
    _record: PhantomData<fn() -> P>,
}

impl<P: PublicRecord> Iterator for RecordHistory<'_, P> {
    type Item = Result<LogicalRecord<P>, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let modification = match self.modifications.next()? {
                Ok(modification) => modification,
                Err(err) => return Some(Err(err.into())),
            };
            if modification.is_delete {
                continue;
            }
            return Some(version_from(&modification));
        }
    }
}

fn version_from<P: PublicRecord>(
    modification: &KeyModification,
) -> Result<LogicalRecord<P>, LedgerError> {
    let mut record: LogicalRecord<P> = decode_json(&modification.value, "historical version")?;
    let committed_at = modification.timestamp.to_rfc3339()?;
    record
        .public
        .set_provenance(&modification.tx_id, &committed_at);
    Ok(record)
}

/// Version log of the public half only. Private collections keep no history,
/// so confidential fields are left at their defaults in every version.
///
/// # Errors
/// Returns an error when the modification log cannot be opened.
pub fn history<'s, P: PublicRecord>(
    invocation: &'s Invocation<'_>,
    key: &CompositeKey,
) -> Result<RecordHistory<'s, P>, LedgerError> {
    let modifications = invocation.store().history_of(key.as_str())?;
    Ok(RecordHistory {
        modifications,
        _record: PhantomData,
    })
}

/// # Errors
/// Returns store errors as-is.
pub fn exists(invocation: &Invocation<'_>, key: &CompositeKey) -> Result<bool, LedgerError> {
    Ok(invocation.store().get_public(key.as_str())?.is_some())
}

/// Number of stored keys, malformed entries included.
///
/// # Errors
/// Returns store errors as-is.
pub fn count(invocation: &Invocation<'_>) -> Result<usize, LedgerError> {
    let mut total = 0_usize;
    for entry in invocation.store().range_scan("", "")? {
        entry?;
        total += 1;
    }
    Ok(total)
}

/// # Errors
/// Returns [`LedgerError::NotFound`] when no record exists under `key`.
pub fn verify_evidence_hash<P: PublicRecord>(
    invocation: &Invocation<'_>,
    key: &CompositeKey,
    expected: &str,
) -> Result<bool, LedgerError> {
    let public = load_public::<P>(invocation.store(), key)?;
    let verified = public.evidence_hash() == expected;
    debug!(namespace = P::NAMESPACE, key = %key, verified, "evidence hash checked");
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::memory::MemoryLedger;
    use super::*;

    const MANUFACTURER: &str = Membership::MANUFACTURER_MSP;
    const LAB: &str = Membership::MRO_LAB_MSP;

    fn fixture_timestamp(offset: i64) -> TxTimestamp {
        TxTimestamp {
            seconds: 1_700_000_000 + offset,
            nanos: 0,
        }
    }

    fn fixture_key(part_number: &str, serial_number: &str) -> CompositeKey {
        match CompositeKey::new(part_number, serial_number) {
            Ok(key) => key,
            Err(err) => panic!("invalid fixture key {part_number}/{serial_number}: {err}"),
        }
    }

    fn defect_payload(
        part_number: &str,
        serial_number: &str,
        defect_detected: bool,
        confidence_score: f64,
        inspector: &str,
    ) -> String {
        json!({
            "partNumber": part_number,
            "serialNumber": serial_number,
            "materialType": "CFRP",
            "inspectionDate": "2024-05-01",
            "inspectionType": "pulsed-thermography",
            "rawVideoHash": format!("sha256:{part_number}:{serial_number}"),
            "rawVideoIPFS": "QmVideo",
            "roi_y1": 40,
            "roi_y2": 200,
            "defectDetected": defect_detected,
            "defectType": "delamination",
            "confidenceScore": confidence_score,
            "bbox_x1": 12.5,
            "bbox_y1": 14.0,
            "bbox_x2": 60.25,
            "bbox_y2": 71.0,
            "inspector": inspector,
        })
        .to_string()
    }

    fn blade_payload(serial_number: &str, occasion_label: &str, inspector: &str) -> String {
        json!({
            "partNumber": "HPT-BLADE",
            "serialNumber": serial_number,
            "occasionLabel": occasion_label,
            "inspectionDate": "2024-06-12",
            "submittedAt": "2024-06-12T09:30:00Z",
            "organization": "MROLabMSP",
            "measurements": { "ar": 41.2, "ap": 40.9, "ab": 38.75 },
            "csvHash": format!("csv:{serial_number}"),
            "inspector": inspector,
        })
        .to_string()
    }

    fn write<P: PublicRecord>(
        ledger: &mut MemoryLedger,
        organization: &StaticIdentity,
        routing: CollectionRouting,
        payload: &str,
    ) -> Result<WriteReceipt, LedgerError> {
        let mut invocation = Invocation::new(ledger, organization, routing);
        add_record::<P>(&mut invocation, payload)
    }

    fn seed<P: PublicRecord>(ledger: &mut MemoryLedger, organization: &str, payload: &str) {
        let identity = StaticIdentity::new(organization);
        if let Err(err) = write::<P>(
            ledger,
            &identity,
            CollectionRouting::PerOrganization,
            payload,
        ) {
            panic!("failed to seed record: {err}");
        }
    }

    fn read_as(
        ledger: &mut MemoryLedger,
        identity: &StaticIdentity,
        key: &CompositeKey,
    ) -> DefectInspection {
        let invocation = Invocation::new(ledger, identity, CollectionRouting::PerOrganization);
        get_record::<DefectInspectionPublic>(&invocation, key)
            .unwrap_or_else(|err| panic!("failed to read {key}: {err}"))
    }

    fn filter_defects(ledger: &mut MemoryLedger, filter: &RecordFilter) -> Vec<String> {
        let identity = StaticIdentity::new(MANUFACTURER);
        let invocation = Invocation::new(ledger, &identity, CollectionRouting::PerOrganization);
        filter_records::<DefectInspectionPublic>(&invocation, filter)
            .unwrap_or_else(|err| panic!("filter failed: {err}"))
            .into_iter()
            .map(|record| record.public.serial_number)
            .collect()
    }

    // Test IDs: TKEY-001
    #[test]
    fn composite_key_joins_part_and_serial() {
        let key = fixture_key("P100", "S_42");
        assert_eq!(key.as_str(), "P100_S_42");
        assert_eq!(key.part_number(), "P100");
        assert_eq!(key.serial_number(), "S_42");

        let parsed = CompositeKey::parse("P100_S_42")
            .unwrap_or_else(|err| panic!("failed to parse key: {err}"));
        assert_eq!(parsed, key);
    }

    // Test IDs: TKEY-002
    #[test]
    fn composite_key_rejects_blank_halves_and_ambiguous_parts() {
        for (part, serial, expected) in [
            ("", "S1", "partNumber MUST be provided"),
            ("P1", "  ", "serialNumber MUST be provided"),
            ("P_1", "S1", "MUST NOT contain"),
        ] {
            match CompositeKey::new(part, serial) {
                Err(LedgerError::Validation(message)) => assert!(
                    message.contains(expected),
                    "`{message}` did not contain `{expected}`"
                ),
                other => panic!("expected validation error for {part}/{serial}, got {other:?}"),
            }
        }
        assert!(matches!(
            CompositeKey::parse("no-separator"),
            Err(LedgerError::Validation(_))
        ));
    }

    // Test IDs: TRT-001
    #[test]
    fn per_organization_routing_maps_known_memberships() {
        let routing = CollectionRouting::PerOrganization;
        assert_eq!(
            routing.resolve(&OrganizationId::new(MANUFACTURER)),
            Ok(CollectionName::new("private-manufacturer"))
        );
        assert_eq!(
            routing.resolve(&OrganizationId::new(LAB)),
            Ok(CollectionName::new("private-lab"))
        );
        assert_eq!(
            routing.resolve(&OrganizationId::new("RegulatorMSP")),
            Err(LedgerError::UnknownOrganization(OrganizationId::new(
                "RegulatorMSP"
            )))
        );
        assert_eq!(
            CollectionRouting::SharedOnly.resolve(&OrganizationId::new("RegulatorMSP")),
            Ok(CollectionName::shared())
        );
    }

    // Test IDs: TSPL-001
    #[test]
    fn owner_reads_full_record_and_other_organization_reads_public_projection() {
        let mut ledger = MemoryLedger::new();
        ledger.begin("tx-write", fixture_timestamp(0));
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("P100", "S1", true, 0.92, "Jane Doe"),
        );

        ledger.begin("tx-read", fixture_timestamp(60));
        let key = fixture_key("P100", "S1");
        let owner_view = read_as(&mut ledger, &StaticIdentity::new(MANUFACTURER), &key);
        let lab_view = read_as(&mut ledger, &StaticIdentity::new(LAB), &key);

        assert_eq!(owner_view.private.inspector, "Jane Doe");
        assert_eq!(lab_view.private.inspector, "");
        assert_eq!(owner_view.public, lab_view.public);
        assert_eq!(owner_view.public.organization, MANUFACTURER);
        assert_eq!(owner_view.public.tx_id, "tx-read");
        assert_eq!(owner_view.public.blockchain_timestamp, "2023-11-14T22:14:20Z");
        assert_eq!(owner_view.public.submitted_at, "2023-11-14T22:13:20Z");
    }

    // Test IDs: TSPL-002
    #[test]
    fn stored_public_half_never_contains_confidential_fields() {
        let mut ledger = MemoryLedger::new();
        seed::<DefectInspectionPublic>(
            &mut ledger,
            LAB,
            &defect_payload("P100", "S1", true, 0.5, "Jane Doe"),
        );

        let stored = match ledger.get_public("P100_S1") {
            Ok(Some(bytes)) => bytes,
            other => panic!("public half missing: {other:?}"),
        };
        let document: Value = serde_json::from_slice(&stored)
            .unwrap_or_else(|err| panic!("stored public half is not JSON: {err}"));
        assert!(document.get("inspector").is_none());

        let private = ledger
            .get_private(&CollectionName::new("private-lab"), "P100_S1")
            .unwrap_or_else(|err| panic!("private read failed: {err}"));
        assert_eq!(private, Some(br#"{"inspector":"Jane Doe"}"#.to_vec()));
    }

    // Test IDs: TSPL-003
    #[test]
    fn unknown_organization_write_touches_nothing() {
        let mut ledger = MemoryLedger::new();
        for identity in [StaticIdentity::new("RegulatorMSP"), StaticIdentity::anonymous()] {
            let result = write::<DefectInspectionPublic>(
                &mut ledger,
                &identity,
                CollectionRouting::PerOrganization,
                &defect_payload("P100", "S1", true, 0.9, "Jane Doe"),
            );
            assert!(matches!(result, Err(LedgerError::UnknownOrganization(_))));
        }
        assert_eq!(ledger.public_len(), 0);
        assert_eq!(ledger.private_len(), 0);
    }

    // Test IDs: TSPL-004
    #[test]
    fn invalid_payloads_are_rejected_before_writing() {
        let mut ledger = MemoryLedger::new();
        let identity = StaticIdentity::new(MANUFACTURER);

        let malformed = write::<DefectInspectionPublic>(
            &mut ledger,
            &identity,
            CollectionRouting::PerOrganization,
            "{\"partNumber\": ",
        );
        assert!(matches!(malformed, Err(LedgerError::Decode(_))));

        let blank_serial = write::<DefectInspectionPublic>(
            &mut ledger,
            &identity,
            CollectionRouting::PerOrganization,
            &defect_payload("P100", " ", true, 0.9, "Jane Doe"),
        );
        assert!(matches!(blank_serial, Err(LedgerError::Validation(_))));
        assert_eq!(ledger.public_len(), 0);
    }

    // Test IDs: TSPL-005
    #[test]
    fn anonymous_reader_degrades_to_public_projection() {
        let mut ledger = MemoryLedger::new();
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("P100", "S1", true, 0.9, "Jane Doe"),
        );

        let key = fixture_key("P100", "S1");
        let view = read_as(&mut ledger, &StaticIdentity::anonymous(), &key);
        assert_eq!(view.private, InspectorIdentity::default());
        assert_eq!(view.public.part_number, "P100");
        assert!((view.public.confidence_score - 0.9).abs() < f64::EPSILON);

        let missing = {
            let identity = StaticIdentity::new(MANUFACTURER);
            let invocation =
                Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
            get_record::<DefectInspectionPublic>(&invocation, &fixture_key("P404", "S1"))
        };
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    }

    // Test IDs: TSPL-006
    #[test]
    fn private_only_reads_are_strict() {
        let mut ledger = MemoryLedger::new();
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("P100", "S1", true, 0.9, "Jane Doe"),
        );
        let key = fixture_key("P100", "S1");

        let read_private = |ledger: &mut MemoryLedger, identity: StaticIdentity| {
            let invocation = Invocation::new(ledger, &identity, CollectionRouting::PerOrganization);
            get_record_private::<DefectInspectionPublic>(&invocation, &key)
        };

        assert_eq!(
            read_private(&mut ledger, StaticIdentity::new(MANUFACTURER)),
            Ok(InspectorIdentity {
                inspector: "Jane Doe".to_string()
            })
        );
        assert!(matches!(
            read_private(&mut ledger, StaticIdentity::new(LAB)),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            read_private(&mut ledger, StaticIdentity::anonymous()),
            Err(LedgerError::UnknownOrganization(_))
        ));
    }

    // Test IDs: TSPL-007
    #[test]
    fn shared_routing_exposes_confidential_fields_to_every_organization() {
        let mut ledger = MemoryLedger::new();
        let writer = StaticIdentity::new(MANUFACTURER);
        if let Err(err) = write::<BladeInspectionPublic>(
            &mut ledger,
            &writer,
            CollectionRouting::SharedOnly,
            &blade_payload("SN-1", "manual", "Ari"),
        ) {
            panic!("shared write failed: {err}");
        }

        let reader = StaticIdentity::new(LAB);
        let invocation = Invocation::new(&mut ledger, &reader, CollectionRouting::SharedOnly);
        let record = get_record::<BladeInspectionPublic>(&invocation, &fixture_key("HPT-BLADE", "SN-1"))
            .unwrap_or_else(|err| panic!("shared read failed: {err}"));
        assert_eq!(record.private.inspector, "Ari");
        assert_eq!(record.public.organization, LAB);
        assert_eq!(record.public.submitted_at, "2024-06-12T09:30:00Z");
    }

    // Test IDs: TFLT-001
    #[test]
    fn confidence_filter_requires_detection_and_threshold() {
        let mut ledger = MemoryLedger::new();
        for (serial, detected, score) in [("S1", true, 0.92), ("S2", true, 0.5), ("S3", false, 0.99)] {
            seed::<DefectInspectionPublic>(
                &mut ledger,
                MANUFACTURER,
                &defect_payload("P100", serial, detected, score, "Jane Doe"),
            );
        }

        assert_eq!(
            filter_defects(&mut ledger, &RecordFilter::by_confidence_threshold(0.9)),
            vec!["S1".to_string()]
        );
        assert!(filter_defects(&mut ledger, &RecordFilter::by_confidence_threshold(0.95)).is_empty());
        assert_eq!(
            filter_defects(&mut ledger, &RecordFilter::by_confidence_threshold(0.0)),
            vec!["S1".to_string(), "S2".to_string()]
        );
        assert!(filter_defects(&mut ledger, &RecordFilter::by_confidence_threshold(1.01)).is_empty());
    }

    // Test IDs: TFLT-002
    #[test]
    fn part_number_filter_is_exact() {
        let mut ledger = MemoryLedger::new();
        for (part, serial) in [("P100", "S1"), ("P1000", "S2"), ("P100", "S3")] {
            seed::<DefectInspectionPublic>(
                &mut ledger,
                LAB,
                &defect_payload(part, serial, true, 0.7, "Kim"),
            );
        }

        assert_eq!(
            filter_defects(&mut ledger, &RecordFilter::by_part_number("P100")),
            vec!["S1".to_string(), "S3".to_string()]
        );
        assert!(filter_defects(&mut ledger, &RecordFilter::by_part_number("p100")).is_empty());
    }

    // Test IDs: TFLT-003
    #[test]
    fn occasion_filter_matches_with_and_without_pushdown() {
        for ledger in [MemoryLedger::new(), MemoryLedger::new().without_rich_query()] {
            let mut ledger = ledger;
            for (serial, label) in [("SN-1", "manual"), ("SN-2", "before_surfacing"), ("SN-3", "manual")] {
                seed::<BladeInspectionPublic>(&mut ledger, LAB, &blade_payload(serial, label, "Ari"));
            }

            let identity = StaticIdentity::new(LAB);
            let invocation =
                Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
            let matched = filter_records::<BladeInspectionPublic>(
                &invocation,
                &RecordFilter::by_occasion_label("manual"),
            )
            .unwrap_or_else(|err| panic!("occasion filter failed: {err}"));
            let serials = matched
                .iter()
                .map(|record| record.public.serial_number.as_str())
                .collect::<Vec<_>>();
            assert_eq!(serials, vec!["SN-1", "SN-3"]);
            assert!(matched.iter().all(|record| record.private.inspector == "Ari"));
        }
    }

    // Test IDs: TSCN-001
    #[test]
    fn scan_skips_malformed_entries() {
        let mut ledger = MemoryLedger::new();
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("P100", "S1", true, 0.9, "Jane Doe"),
        );
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("P100", "S2", true, 0.8, "Jane Doe"),
        );
        if let Err(err) = ledger.put_public("P100_S0", b"not json") {
            panic!("failed to inject entry: {err}");
        }
        if let Err(err) = ledger.put_private(
            &CollectionName::new("private-manufacturer"),
            "P100_S2",
            b"{",
        ) {
            panic!("failed to inject private entry: {err}");
        }

        let scanned_by = |ledger: &mut MemoryLedger, organization: &str| {
            let identity = StaticIdentity::new(organization);
            let invocation = Invocation::new(ledger, &identity, CollectionRouting::PerOrganization);
            let records = scan_all::<DefectInspectionPublic>(&invocation)
                .unwrap_or_else(|err| panic!("scan failed: {err}"))
                .collect::<Result<Vec<_>, _>>()
                .unwrap_or_else(|err| panic!("scan item failed: {err}"));
            records
                .into_iter()
                .map(|record| (record.public.serial_number, record.private.inspector))
                .collect::<Vec<_>>()
        };

        assert_eq!(
            scanned_by(&mut ledger, MANUFACTURER),
            vec![
                ("S1".to_string(), "Jane Doe".to_string()),
                ("S2".to_string(), String::new())
            ]
        );
        assert_eq!(
            scanned_by(&mut ledger, LAB),
            vec![("S1".to_string(), String::new()), ("S2".to_string(), String::new())]
        );

        let identity = StaticIdentity::anonymous();
        let invocation = Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
        assert_eq!(count(&invocation), Ok(3));
        assert_eq!(exists(&invocation, &fixture_key("P100", "S2")), Ok(true));
        assert_eq!(exists(&invocation, &fixture_key("P100", "S9")), Ok(false));
    }

    // Test IDs: TSCN-002
    #[test]
    fn owner_keeps_public_data_when_private_half_is_malformed() {
        let mut ledger = MemoryLedger::new();
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("PN-100", "SN-1", true, 0.92, "Jane Doe"),
        );
        if let Err(err) = ledger.put_private(
            &CollectionName::new("private-manufacturer"),
            "PN-100_SN-1",
            b"{",
        ) {
            panic!("failed to inject private entry: {err}");
        }

        let key = fixture_key("PN-100", "SN-1");
        let owner_view = read_as(&mut ledger, &StaticIdentity::new(MANUFACTURER), &key);
        assert_eq!(owner_view.private.inspector, "");
        assert!((owner_view.public.confidence_score - 0.92).abs() < f64::EPSILON);

        let filter = RecordFilter::by_confidence_threshold(0.9);
        assert_eq!(filter_defects(&mut ledger, &filter), vec!["SN-1".to_string()]);

        let identity = StaticIdentity::new(LAB);
        let invocation = Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
        let lab_matches = filter_records::<DefectInspectionPublic>(&invocation, &filter)
            .unwrap_or_else(|err| panic!("filter failed: {err}"));
        assert_eq!(lab_matches.len(), 1);
        assert_eq!(count(&invocation), Ok(1));
    }

    // Test IDs: THIS-001
    #[test]
    fn history_skips_deletions_and_keeps_version_provenance() {
        let mut ledger = MemoryLedger::new();
        for (version, score) in [0.4, 0.6, 0.8].into_iter().enumerate() {
            let offset = i64::try_from(version).unwrap_or(i64::MAX);
            ledger.begin(format!("tx-{version}"), fixture_timestamp(offset));
            seed::<DefectInspectionPublic>(
                &mut ledger,
                MANUFACTURER,
                &defect_payload("P100", "S1", true, score, "Jane Doe"),
            );
        }
        ledger.begin("tx-delete", fixture_timestamp(10));
        ledger.delete_public("P100_S1");
        ledger.begin("tx-rewrite", fixture_timestamp(20));
        seed::<DefectInspectionPublic>(
            &mut ledger,
            MANUFACTURER,
            &defect_payload("P100", "S1", true, 0.95, "Jane Doe"),
        );

        ledger.begin("tx-read", fixture_timestamp(30));
        let identity = StaticIdentity::new(MANUFACTURER);
        let invocation = Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
        let versions = history::<DefectInspectionPublic>(&invocation, &fixture_key("P100", "S1"))
            .unwrap_or_else(|err| panic!("history failed: {err}"))
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_else(|err| panic!("history item failed: {err}"));

        let tx_ids = versions
            .iter()
            .map(|version| version.public.tx_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(tx_ids, vec!["tx-0", "tx-1", "tx-2", "tx-rewrite"]);
        assert_eq!(versions[1].public.blockchain_timestamp, "2023-11-14T22:13:21Z");
        assert!(versions.iter().all(|version| version.private.inspector.is_empty()));

        let empty = history::<DefectInspectionPublic>(&invocation, &fixture_key("P404", "S1"))
            .unwrap_or_else(|err| panic!("history failed: {err}"))
            .count();
        assert_eq!(empty, 0);
    }

    // Test IDs: THIS-002
    #[test]
    fn history_fails_on_undecodable_version() {
        let mut ledger = MemoryLedger::new();
        if let Err(err) = ledger.put_public("P100_S1", b"\x00garbage") {
            panic!("failed to inject entry: {err}");
        }
        let identity = StaticIdentity::new(MANUFACTURER);
        let invocation = Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
        let first = history::<DefectInspectionPublic>(&invocation, &fixture_key("P100", "S1"))
            .unwrap_or_else(|err| panic!("history failed: {err}"))
            .next();
        assert!(matches!(first, Some(Err(LedgerError::Decode(_)))));
    }

    // Test IDs: THSH-001
    #[test]
    fn evidence_hash_verification_is_exact() {
        let mut ledger = MemoryLedger::new();
        seed::<BladeInspectionPublic>(&mut ledger, LAB, &blade_payload("SN-1", "manual", "Ari"));
        let identity = StaticIdentity::anonymous();
        let invocation = Invocation::new(&mut ledger, &identity, CollectionRouting::PerOrganization);
        let key = fixture_key("HPT-BLADE", "SN-1");

        assert_eq!(
            verify_evidence_hash::<BladeInspectionPublic>(&invocation, &key, "csv:SN-1"),
            Ok(true)
        );
        assert_eq!(
            verify_evidence_hash::<BladeInspectionPublic>(&invocation, &key, "CSV:SN-1"),
            Ok(false)
        );
        assert!(matches!(
            verify_evidence_hash::<BladeInspectionPublic>(
                &invocation,
                &fixture_key("HPT-BLADE", "SN-9"),
                "csv:SN-9"
            ),
            Err(LedgerError::NotFound(_))
        ));
    }

    // Test IDs: TWIR-001
    #[test]
    fn blade_record_serializes_as_one_flat_object() {
        let record: BladeInspection = serde_json::from_str(&blade_payload("SN-1", "manual", "Ari"))
            .unwrap_or_else(|err| panic!("failed to parse blade: {err}"));
        let value = serde_json::to_value(&record)
            .unwrap_or_else(|err| panic!("failed to serialize blade: {err}"));

        assert_eq!(value["inspector"], json!("Ari"));
        assert_eq!(value["csvHash"], json!("csv:SN-1"));
        assert_eq!(value["measurements"]["ab"], json!(38.75));
        assert_eq!(value["measurements"]["ak"], json!(0.0));
        assert!(value.get("txId").is_none());
    }

    // Test IDs: TSPL-008, TKEY-003
    proptest! {
        #[test]
        fn property_composite_key_routing_is_stable(
            part in "[A-Za-z0-9-]{1,12}",
            serial in "[A-Za-z0-9_-]{1,12}",
        ) {
            let key = CompositeKey::new(&part, &serial)
                .unwrap_or_else(|err| panic!("valid key rejected: {err}"));

            prop_assert_eq!(key.part_number(), part.as_str());
            prop_assert_eq!(key.serial_number(), serial.as_str());
            let parsed = CompositeKey::parse(key.as_str())
                .unwrap_or_else(|err| panic!("failed to parse {key}: {err}"));
            prop_assert_eq!(&parsed, &key);

            let encoded = serde_json::to_string(&key)
                .unwrap_or_else(|err| panic!("failed to encode {key}: {err}"));
            let decoded: CompositeKey = serde_json::from_str(&encoded)
                .unwrap_or_else(|err| panic!("failed to decode {encoded}: {err}"));
            prop_assert_eq!(decoded, key);
        }

        #[test]
        fn property_merge_of_split_restores_the_record(
            part in "[A-Z0-9-]{1,12}",
            serial in "[A-Za-z0-9_]{1,12}",
            inspector in ".{0,24}",
            score in 0.0f64..1.0,
        ) {
            let payload = defect_payload(&part, &serial, true, score, &inspector);
            let record: DefectInspection = serde_json::from_str(&payload)
                .unwrap_or_else(|err| panic!("failed to parse payload: {err}"));

            let (public, private) = record.clone().split();
            prop_assert_eq!(&LogicalRecord::merge(public.clone(), Some(private)), &record);

            let projected = LogicalRecord::merge(public, None);
            prop_assert_eq!(&projected.public, &record.public);
            prop_assert_eq!(projected.private.inspector, String::new());
        }
    }
}
