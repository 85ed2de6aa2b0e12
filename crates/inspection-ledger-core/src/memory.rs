//! In-memory [`LedgerStore`] used by unit tests and benchmarks.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    CollectionName, HistoryIter, KeyModification, KeyValue, KeyValueIter, LedgerStore, Selector,
    StoreError, TxTimestamp,
};

#[derive(Debug, Clone)]
pub struct MemoryLedger {
    public: BTreeMap<String, Vec<u8>>,
    private: BTreeMap<(String, String), Vec<u8>>,
    history: BTreeMap<String, Vec<KeyModification>>,
    tx_id: String,
    timestamp: TxTimestamp,
    rich_query: bool,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            public: BTreeMap::new(),
            private: BTreeMap::new(),
            history: BTreeMap::new(),
            tx_id: "tx-0000".to_string(),
            timestamp: TxTimestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            },
            rich_query: true,
        }
    }

    /// Behave like a key-value backend without selector queries.
    #[must_use]
    pub fn without_rich_query(mut self) -> Self {
        self.rich_query = false;
        self
    }

    /// Subsequent operations run as transaction `tx_id` committed at `timestamp`.
    pub fn begin(&mut self, tx_id: impl Into<String>, timestamp: TxTimestamp) {
        self.tx_id = tx_id.into();
        self.timestamp = timestamp;
    }

    pub fn delete_public(&mut self, key: &str) {
        if self.public.remove(key).is_some() {
            self.record_modification(key, true, Vec::new());
        }
    }

    #[must_use]
    pub fn public_len(&self) -> usize {
        self.public.len()
    }

    #[must_use]
    pub fn private_len(&self) -> usize {
        self.private.len()
    }

    fn record_modification(&mut self, key: &str, is_delete: bool, value: Vec<u8>) {
        self.history
            .entry(key.to_string())
            .or_default()
            .push(KeyModification {
                tx_id: self.tx_id.clone(),
                timestamp: self.timestamp,
                is_delete,
                value,
            });
    }
}

impl LedgerStore for MemoryLedger {
    fn get_public(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.public.get(key).cloned())
    }

    fn put_public(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.public.insert(key.to_string(), value.to_vec());
        self.record_modification(key, false, value.to_vec());
        Ok(())
    }

    fn get_private(
        &self,
        collection: &CollectionName,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .private
            .get(&(collection.as_str().to_string(), key.to_string()))
            .cloned())
    }

    fn put_private(
        &mut self,
        collection: &CollectionName,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.private.insert(
            (collection.as_str().to_string(), key.to_string()),
            value.to_vec(),
        );
        Ok(())
    }

    fn range_scan(&self, start: &str, end: &str) -> Result<KeyValueIter<'_>, StoreError> {
        let start = start.to_string();
        let end = end.to_string();
        Ok(Box::new(
            self.public
                .iter()
                .filter(move |(key, _)| {
                    key.as_str() >= start.as_str() && (end.is_empty() || key.as_str() < end.as_str())
                })
                .map(|(key, value)| {
                    Ok(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    })
                }),
        ))
    }

    fn rich_query(&self, selector: &Selector) -> Result<Option<KeyValueIter<'_>>, StoreError> {
        if !self.rich_query {
            return Ok(None);
        }
        let selector = selector.clone();
        Ok(Some(Box::new(
            self.public
                .iter()
                .filter(move |(_, value)| {
                    serde_json::from_slice::<Value>(value)
                        .is_ok_and(|document| selector.matches(&document))
                })
                .map(|(key, value)| {
                    Ok(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    })
                }),
        )))
    }

    fn history_of(&self, key: &str) -> Result<HistoryIter<'_>, StoreError> {
        let modifications = self.history.get(key).cloned().unwrap_or_default();
        Ok(Box::new(modifications.into_iter().map(Ok)))
    }

    fn tx_id(&self) -> &str {
        &self.tx_id
    }

    fn tx_timestamp(&self) -> TxTimestamp {
        self.timestamp
    }
}
