//! Embedded event store.
//!
//! Events live in an ordered key-value database under three index families:
//! a forward index for ascending scans, a reverse index (complemented order
//! key, mirrored block number) for descending scans, and an upserted unique
//! index for latest-per-entity lookups. A `meta` table carries the durable
//! resume cursor. All writes for one event happen in a single transaction, so
//! readers never observe a partially indexed event.

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::StorageError;
use crate::felt::{block_key, invert_order_key, reverse_block_key};

const FORWARD: TableDefinition<&str, &[u8]> = TableDefinition::new("event_order");
const REVERSE: TableDefinition<&str, &[u8]> = TableDefinition::new("event_reverse");
const UNIQUE: TableDefinition<&str, &[u8]> = TableDefinition::new("event_unique");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
/// Admin-added registry addresses, keyed by normalized address; the value is
/// the resume cursor at the time of the add.
const REGISTRY: TableDefinition<&str, u64> = TableDefinition::new("registry_addresses");

const LAST_BLOCK_KEY: &str = "last_block";

/// Scan direction for paginated reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Order::Asc),
            "desc" => Some(Order::Desc),
            _ => None,
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Order::Asc => write!(f, "asc"),
            Order::Desc => write!(f, "desc"),
        }
    }
}

/// An indexed event as persisted. All hex fields are normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub block_number: u64,
    pub transaction_hash: String,
    pub from_address: String,
    pub keys: Vec<String>,
    pub data: Vec<String>,
    /// Wall-clock of ingestion, not chain time.
    pub timestamp: i64,
    pub order_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    /// Present when the event was decoded against a contract ABI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded: Option<serde_json::Value>,
}

impl StoredEvent {
    fn forward_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.order_key,
            block_key(self.block_number),
            self.transaction_hash
        )
    }

    fn reverse_key(&self) -> String {
        format!(
            "{}:{}:{}",
            invert_order_key(&self.order_key),
            reverse_block_key(self.block_number),
            self.transaction_hash
        )
    }

    /// Equality match against a decoded-record query: emitting contract,
    /// event type, and every filter pair on the decoded top-level fields.
    fn matches(
        &self,
        contract: &str,
        event_type: &str,
        filters: &serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        if self.from_address != contract {
            return false;
        }
        let Some(decoded) = self.decoded.as_ref().and_then(|d| d.as_object()) else {
            return false;
        };
        if decoded.get("event_type").and_then(|v| v.as_str()) != Some(event_type) {
            return false;
        }
        filters.iter().all(|(key, value)| decoded.get(key) == Some(value))
    }
}

/// The event store. One instance owns the on-disk state exclusively.
pub struct EventStore {
    db: Database,
}

impl EventStore {
    /// Opens (or creates) the store under `<data_dir>/indexer_data/`.
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        let dir = data_dir.join("indexer_data");
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::DataDir {
            path: dir.display().to_string(),
            source: e,
        })?;
        let db = Database::create(dir.join("events.redb"))?;

        // Create all tables up front so read transactions never race table
        // creation.
        let txn = db.begin_write()?;
        {
            txn.open_table(FORWARD)?;
            txn.open_table(REVERSE)?;
            txn.open_table(UNIQUE)?;
            txn.open_table(META)?;
            txn.open_table(REGISTRY)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    /// Writes one event under every applicable index and max-advances the
    /// resume cursor, atomically. Re-storing the same
    /// `(order_key, block_number, tx_hash)` triple overwrites in place, which
    /// makes re-processing after a restart idempotent.
    pub fn store_event(&self, event: &StoredEvent) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(event)?;
        let txn = self.db.begin_write()?;
        {
            let mut forward = txn.open_table(FORWARD)?;
            forward.insert(event.forward_key().as_str(), encoded.as_slice())?;

            let mut reverse = txn.open_table(REVERSE)?;
            reverse.insert(event.reverse_key().as_str(), encoded.as_slice())?;

            if let Some(unique_key) = &event.unique_key {
                let mut unique = txn.open_table(UNIQUE)?;
                unique.insert(unique_key.as_str(), encoded.as_slice())?;
            }

            let mut meta = txn.open_table(META)?;
            let current = meta.get(LAST_BLOCK_KEY)?.map(|g| g.value()).unwrap_or(0);
            if event.block_number > current {
                meta.insert(LAST_BLOCK_KEY, event.block_number)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Advances the resume cursor to `block` (never backwards). Called when a
    /// polled range completes, so empty tails are not re-fetched on restart.
    pub fn advance_cursor(&self, block: u64) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            let current = meta.get(LAST_BLOCK_KEY)?.map(|g| g.value()).unwrap_or(0);
            if block > current {
                meta.insert(LAST_BLOCK_KEY, block)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Highest block fully persisted, or 0 when nothing has been stored.
    pub fn last_processed_block(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        Ok(meta.get(LAST_BLOCK_KEY)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Durably records an admin-added registry address so the directory can
    /// be rebuilt after a restart. Re-adding overwrites in place.
    pub fn add_registry_address(&self, address: &str, cursor: u64) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(REGISTRY)?;
            table.insert(address, cursor)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Every registry address recorded by an administrative add.
    pub fn registry_addresses(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REGISTRY)?;
        let mut addresses = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            addresses.push(key.value().to_string());
        }
        Ok(addresses)
    }

    /// Stored registry announcements: events whose decoded record carries a
    /// `registry_address` field. Their raw keys/data still name the announced
    /// contract and class hash, which is what directory reconstruction needs.
    pub fn announcement_events(&self) -> Result<Vec<StoredEvent>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORWARD)?;
        let mut events = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let event: StoredEvent = serde_json::from_slice(value.value())?;
            let is_announcement = event
                .decoded
                .as_ref()
                .and_then(|d| d.get("registry_address"))
                .is_some();
            if is_announcement {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Paginated scan in the requested direction. Returns the page and the
    /// total event count. `page_length` is clamped into `(0, 100)`.
    pub fn list(
        &self,
        order: Order,
        page: usize,
        page_length: usize,
    ) -> Result<(Vec<StoredEvent>, usize), StorageError> {
        let page_length = page_length.clamp(1, 99);
        let txn = self.db.begin_read()?;
        let table = match order {
            Order::Asc => txn.open_table(FORWARD)?,
            Order::Desc => txn.open_table(REVERSE)?,
        };
        let total = table.len()? as usize;
        let mut events = Vec::with_capacity(page_length);
        for entry in table.iter()?.skip(page * page_length).take(page_length) {
            let (_, value) = entry?;
            events.push(serde_json::from_slice(value.value())?);
        }
        Ok((events, total))
    }

    /// Latest-per-unique scan: at most one event per unique key, sorted by
    /// order key in the requested direction, paginated.
    pub fn list_unique(
        &self,
        order: Order,
        page: usize,
        page_length: usize,
    ) -> Result<(Vec<StoredEvent>, usize), StorageError> {
        let page_length = page_length.clamp(1, 99);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UNIQUE)?;

        let mut events: Vec<StoredEvent> = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            events.push(serde_json::from_slice(value.value())?);
        }
        match order {
            Order::Asc => events.sort_by(|a, b| a.order_key.cmp(&b.order_key)),
            Order::Desc => events.sort_by(|a, b| b.order_key.cmp(&a.order_key)),
        }

        let total = events.len();
        let page_events = events
            .into_iter()
            .skip(page * page_length)
            .take(page_length)
            .collect();
        Ok((page_events, total))
    }

    pub fn event_count(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(FORWARD)?.len()?)
    }

    pub fn unique_event_count(&self) -> Result<u64, StorageError> {
        let txn = self.db.begin_read()?;
        Ok(txn.open_table(UNIQUE)?.len()?)
    }

    /// All events emitted in one block, in chain order.
    pub fn events_by_block(&self, block_number: u64) -> Result<Vec<StoredEvent>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORWARD)?;
        let mut events = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let event: StoredEvent = serde_json::from_slice(value.value())?;
            if event.block_number == block_number {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Most recently stored event matching contract, type and filters.
    pub fn latest_matching(
        &self,
        contract: &str,
        event_type: &str,
        filters: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<StoredEvent>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REVERSE)?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let event: StoredEvent = serde_json::from_slice(value.value())?;
            if event.matches(contract, event_type, filters) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Matching events in descending insertion order, paginated with 1-based
    /// pages.
    pub fn events_matching(
        &self,
        contract: &str,
        event_type: &str,
        filters: &serde_json::Map<String, serde_json::Value>,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let skip = page.saturating_sub(1) * limit;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REVERSE)?;
        let mut events = Vec::with_capacity(limit);
        let mut seen = 0usize;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let event: StoredEvent = serde_json::from_slice(value.value())?;
            if !event.matches(contract, event_type, filters) {
                continue;
            }
            if seen >= skip {
                events.push(event);
                if events.len() == limit {
                    break;
                }
            }
            seen += 1;
        }
        Ok(events)
    }

    /// Group-by on a decoded field: the latest event per distinct field
    /// value, groups in descending insertion order of their representative.
    pub fn unique_groups(
        &self,
        contract: &str,
        event_type: &str,
        group_field: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REVERSE)?;
        let mut seen_groups = std::collections::HashSet::new();
        let mut representatives = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let event: StoredEvent = serde_json::from_slice(value.value())?;
            if !event.matches(contract, event_type, &serde_json::Map::new()) {
                continue;
            }
            let group = event
                .decoded
                .as_ref()
                .and_then(|d| d.get(group_field))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            if seen_groups.insert(group) {
                representatives.push(event);
            }
        }
        Ok(representatives
            .into_iter()
            .skip(page.saturating_sub(1) * limit)
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::felt::normalize_hex;
    use tempfile::TempDir;

    fn event(block: u64, tx: &str, order_key: &str, unique: Option<&str>) -> StoredEvent {
        StoredEvent {
            block_number: block,
            transaction_hash: normalize_hex(tx),
            from_address: normalize_hex("0xc0ffee"),
            keys: vec![normalize_hex("0x1")],
            data: vec![normalize_hex("0x2")],
            timestamp: 1_700_000_000,
            order_key: normalize_hex(order_key),
            unique_key: unique.map(normalize_hex),
            decoded: None,
        }
    }

    fn open_store(dir: &TempDir) -> EventStore {
        EventStore::open(dir.path()).unwrap()
    }

    #[test]
    fn descending_scan_is_exact_reverse_of_ascending() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // Deliberately stored out of order.
        for (block, tx, key) in [(20, "0xb", "0x5"), (10, "0xa", "0x5"), (30, "0xc", "0x1")] {
            store.store_event(&event(block, tx, key, None)).unwrap();
        }

        let (asc, total_asc) = store.list(Order::Asc, 0, 50).unwrap();
        let (desc, total_desc) = store.list(Order::Desc, 0, 50).unwrap();
        assert_eq!(total_asc, 3);
        assert_eq!(total_desc, 3);

        let mut reversed = desc.clone();
        reversed.reverse();
        assert_eq!(asc, reversed);

        // Same order key ties break on block number.
        assert_eq!(asc[0].block_number, 30); // order key 0x1 first
        assert_eq!(asc[1].block_number, 10);
        assert_eq!(asc[2].block_number, 20);
    }

    #[test]
    fn unique_index_keeps_latest_stored() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // Blocks 10, 20, 15 in that order: latest *stored* wins.
        store.store_event(&event(10, "0xa", "0x10", Some("0xaa"))).unwrap();
        store.store_event(&event(20, "0xb", "0x20", Some("0xaa"))).unwrap();
        store.store_event(&event(15, "0xc", "0x15", Some("0xaa"))).unwrap();

        let (unique, total) = store.list_unique(Order::Asc, 0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(unique[0].block_number, 15);

        // The forward index still holds all three.
        let (all, total_all) = store.list(Order::Asc, 0, 10).unwrap();
        assert_eq!(total_all, 3);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn cursor_tracks_highest_stored_block() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.last_processed_block().unwrap(), 0);

        store.store_event(&event(500, "0xa", "0x1", None)).unwrap();
        store.store_event(&event(400, "0xb", "0x2", None)).unwrap();
        assert_eq!(store.last_processed_block().unwrap(), 500);

        store.advance_cursor(600).unwrap();
        assert_eq!(store.last_processed_block().unwrap(), 600);
        store.advance_cursor(550).unwrap();
        assert_eq!(store.last_processed_block().unwrap(), 600);
    }

    #[test]
    fn restart_preserves_contents_and_restore_is_idempotent() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.store_event(&event(1, "0xa", "0x1", Some("0xu"))).unwrap();
            store.store_event(&event(2, "0xb", "0x2", None)).unwrap();
        }

        let store = open_store(&dir);
        let (events, total) = store.list(Order::Asc, 0, 10).unwrap();
        assert_eq!(total, 2);
        assert_eq!(store.last_processed_block().unwrap(), 2);

        // Re-storing the same triple does not duplicate.
        store.store_event(&events[0]).unwrap();
        let (_, total_after) = store.list(Order::Asc, 0, 10).unwrap();
        assert_eq!(total_after, 2);
        assert_eq!(store.unique_event_count().unwrap(), 1);
    }

    #[test]
    fn pagination_windows_and_clamping() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for block in 0..7u64 {
            store
                .store_event(&event(block, &format!("0x{block:x}"), &format!("0x{block:x}"), None))
                .unwrap();
        }

        let (page0, total) = store.list(Order::Asc, 0, 3).unwrap();
        let (page2, _) = store.list(Order::Asc, 2, 3).unwrap();
        assert_eq!(total, 7);
        assert_eq!(page0.len(), 3);
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].block_number, 6);

        // Out-of-range page length falls back into (0, 100).
        let (clamped, _) = store.list(Order::Asc, 0, 0).unwrap();
        assert_eq!(clamped.len(), 1);
    }

    #[test]
    fn by_block_returns_only_that_block() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.store_event(&event(5, "0xa", "0x1", None)).unwrap();
        store.store_event(&event(5, "0xb", "0x2", None)).unwrap();
        store.store_event(&event(6, "0xc", "0x3", None)).unwrap();

        assert_eq!(store.events_by_block(5).unwrap().len(), 2);
        assert_eq!(store.events_by_block(6).unwrap().len(), 1);
        assert!(store.events_by_block(7).unwrap().is_empty());
    }

    fn decoded_event(block: u64, tx: &str, contract: &str, kind: &str, player: &str) -> StoredEvent {
        let mut e = event(block, tx, &format!("0x{block:x}"), None);
        e.from_address = normalize_hex(contract);
        e.decoded = Some(serde_json::json!({
            "player": player,
            "score": block,
            "event_type": kind,
            "contract_address": normalize_hex(contract),
        }));
        e
    }

    #[test]
    fn filtered_queries_match_decoded_fields() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let contract = normalize_hex("0xdead");
        store.store_event(&decoded_event(1, "0xa", "0xdead", "Scored", "alice")).unwrap();
        store.store_event(&decoded_event(2, "0xb", "0xdead", "Scored", "bob")).unwrap();
        store.store_event(&decoded_event(3, "0xc", "0xdead", "Joined", "alice")).unwrap();
        store.store_event(&decoded_event(4, "0xd", "0xbeef", "Scored", "alice")).unwrap();

        let no_filters = serde_json::Map::new();
        let latest = store.latest_matching(&contract, "Scored", &no_filters).unwrap().unwrap();
        assert_eq!(latest.block_number, 2);

        let mut filters = serde_json::Map::new();
        filters.insert("player".to_string(), serde_json::json!("alice"));
        let latest_alice = store.latest_matching(&contract, "Scored", &filters).unwrap().unwrap();
        assert_eq!(latest_alice.block_number, 1);

        let all_scored = store.events_matching(&contract, "Scored", &no_filters, 1, 10).unwrap();
        assert_eq!(all_scored.len(), 2);
        assert_eq!(all_scored[0].block_number, 2); // descending insertion

        let none = store.latest_matching(&contract, "Missing", &no_filters).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn registry_addresses_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let address = normalize_hex("0xfeed");
        {
            let store = open_store(&dir);
            store.add_registry_address(&address, 42).unwrap();
            // Re-adding overwrites rather than duplicating.
            store.add_registry_address(&address, 50).unwrap();
        }

        let store = open_store(&dir);
        assert_eq!(store.registry_addresses().unwrap(), vec![address]);
    }

    #[test]
    fn announcement_events_are_recoverable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // A decoded announcement carries registry_address; a plain contract
        // event carries contract_address instead.
        let mut announcement = event(5, "0xa", "0x1", None);
        announcement.keys = vec![normalize_hex("0x111"), normalize_hex("0xabc")];
        announcement.data = vec![normalize_hex("0x99")];
        announcement.decoded = Some(serde_json::json!({
            "registry_address": normalize_hex("0xfeed"),
            "event_type": "registry::Registry::ContractRegistered",
        }));
        store.store_event(&announcement).unwrap();
        store.store_event(&decoded_event(6, "0xb", "0xabc", "Scored", "alice")).unwrap();

        let found = store.announcement_events().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].keys[1], normalize_hex("0xabc"));
        assert_eq!(found[0].data[0], normalize_hex("0x99"));
    }

    #[test]
    fn unique_groups_collapse_to_latest_per_value() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let contract = normalize_hex("0xdead");
        store.store_event(&decoded_event(1, "0xa", "0xdead", "Scored", "alice")).unwrap();
        store.store_event(&decoded_event(2, "0xb", "0xdead", "Scored", "bob")).unwrap();
        store.store_event(&decoded_event(3, "0xc", "0xdead", "Scored", "alice")).unwrap();

        let groups = store.unique_groups(&contract, "Scored", "player", 1, 10).unwrap();
        assert_eq!(groups.len(), 2);
        // alice's block-3 event is the latest representative and was stored last.
        assert_eq!(groups[0].block_number, 3);
        assert_eq!(groups[1].block_number, 2);
    }
}
