//! Allocation store
//!
//! Durable mapping from client identity to allocation. Writes go to SQLite
//! first and only then to the in-memory indexes, so a successful return means
//! the record is committed. The address index is what enforces address
//! uniqueness across clients.

use crate::db::{AllocationRow, Database};
use crate::types::{Allocation, ClientId};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

const ADMIN_HASH_KEY: &str = "admin_hash";

#[derive(Debug, Default)]
struct Index {
    by_client: HashMap<ClientId, Allocation>,
    by_address: HashMap<IpAddr, ClientId>,
}

impl Index {
    fn insert(&mut self, allocation: Allocation) {
        if let Some(previous) = self.by_client.get(&allocation.client_id) {
            if previous.address != allocation.address {
                self.by_address.remove(&previous.address);
            }
        }
        self.by_address
            .insert(allocation.address, allocation.client_id);
        self.by_client.insert(allocation.client_id, allocation);
    }

    fn remove(&mut self, client_id: &ClientId) -> Option<Allocation> {
        let allocation = self.by_client.remove(client_id)?;
        self.by_address.remove(&allocation.address);
        Some(allocation)
    }
}

/// Durable allocation records with forward and reverse indexes
pub struct AllocationStore {
    db: Database,
    index: RwLock<Index>,
}

impl AllocationStore {
    /// Open the store, replaying every persisted record.
    ///
    /// Records that cannot be decoded are logged and skipped.
    pub fn open(db: Database) -> Result<Self> {
        let rows = db.load_allocations()?;
        let total = rows.len();
        let mut index = Index::default();
        let mut skipped = 0usize;

        for row in rows {
            let allocation = match parse_row(&row) {
                Ok(allocation) => allocation,
                Err(e) => {
                    warn!("Skipping store record: {}", e);
                    skipped += 1;
                    continue;
                }
            };

            if let Some(owner) = index.by_address.get(&allocation.address) {
                warn!(
                    "Skipping store record: {}",
                    Error::StoreCorruption {
                        key: row.client_id.clone(),
                        reason: format!("address {} already bound to {}", allocation.address, owner),
                    }
                );
                skipped += 1;
                continue;
            }

            index.insert(allocation);
        }

        info!(
            "Allocation store loaded {} records ({} skipped)",
            total - skipped,
            skipped
        );

        Ok(Self {
            db,
            index: RwLock::new(index),
        })
    }

    /// Get the allocation held by a client
    pub fn get(&self, client_id: &ClientId) -> Option<Allocation> {
        self.index.read().by_client.get(client_id).cloned()
    }

    /// Insert or update an allocation.
    ///
    /// Fails with [`Error::AddressConflict`] if the address belongs to another
    /// client. Returns once the record is committed to disk.
    pub fn put(&self, allocation: &Allocation) -> Result<()> {
        let mut index = self.index.write();

        if let Some(owner) = index.by_address.get(&allocation.address) {
            if *owner != allocation.client_id {
                return Err(Error::AddressConflict {
                    address: allocation.address,
                    owner: owner.to_string(),
                });
            }
        }

        let record = serde_json::to_string(allocation)?;
        self.db.upsert_allocation(
            &allocation.client_id.to_string(),
            &allocation.address.to_string(),
            &record,
        )?;

        index.insert(allocation.clone());
        debug!("Committed allocation {} -> {}", allocation.client_id, allocation.address);
        Ok(())
    }

    /// Remove a client's allocation, returning it if there was one
    pub fn remove(&self, client_id: &ClientId) -> Result<Option<Allocation>> {
        let mut index = self.index.write();

        if !index.by_client.contains_key(client_id) {
            return Ok(None);
        }

        self.db.delete_allocation(&client_id.to_string())?;
        Ok(index.remove(client_id))
    }

    /// Snapshot of all allocations, ordered by address
    pub fn all(&self) -> impl Iterator<Item = Allocation> {
        let mut snapshot: Vec<Allocation> = self.index.read().by_client.values().cloned().collect();
        snapshot.sort_by_key(|a| (a.address.is_ipv6(), crate::types::addr_to_u128(&a.address)));
        snapshot.into_iter()
    }

    pub fn len(&self) -> usize {
        self.index.read().by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Administrator credential
    // ========================================================================

    /// Replace the stored administrator password hash
    pub fn set_admin_hash(&self, hash: &str) -> Result<()> {
        self.db.kv_set(ADMIN_HASH_KEY, hash)
    }

    /// Stored administrator password hash, if one was ever set
    pub fn admin_hash(&self) -> Result<Option<String>> {
        self.db.kv_get(ADMIN_HASH_KEY)
    }
}

fn parse_row(row: &AllocationRow) -> Result<Allocation> {
    let allocation: Allocation =
        serde_json::from_str(&row.record).map_err(|e| Error::StoreCorruption {
            key: row.client_id.clone(),
            reason: e.to_string(),
        })?;

    if allocation.client_id.to_string() != row.client_id
        || allocation.address.to_string() != row.address
    {
        return Err(Error::StoreCorruption {
            key: row.client_id.clone(),
            reason: "record does not match its key columns".to_string(),
        });
    }

    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::PublicKey;
    use rusqlite::params;
    use tempfile::TempDir;

    fn client(n: u8) -> ClientId {
        PublicKey::from_bytes([n; 32])
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let store = AllocationStore::open(Database::open_memory().unwrap()).unwrap();
        let alloc = Allocation::new(client(1), addr("::1"), 0);

        store.put(&alloc).unwrap();
        assert_eq!(store.get(&client(1)), Some(alloc.clone()));

        assert_eq!(store.remove(&client(1)).unwrap(), Some(alloc));
        assert_eq!(store.get(&client(1)), None);
        assert_eq!(store.remove(&client(1)).unwrap(), None);
        // The address index was cleared with the record
        store.put(&Allocation::new(client(2), addr("::1"), 0)).unwrap();
    }

    #[test]
    fn test_address_conflict() {
        let store = AllocationStore::open(Database::open_memory().unwrap()).unwrap();
        store.put(&Allocation::new(client(1), addr("::1"), 0)).unwrap();

        let err = store
            .put(&Allocation::new(client(2), addr("::1"), 0))
            .unwrap_err();
        assert!(matches!(err, Error::AddressConflict { .. }));
        assert_eq!(store.get(&client(2)), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_renewal_overwrites_record() {
        let store = AllocationStore::open(Database::open_memory().unwrap()).unwrap();
        let mut alloc = Allocation::new(client(1), addr("::1"), 0);
        store.put(&alloc).unwrap();

        alloc.last_renewed_at += 100;
        store.put(&alloc).unwrap();
        assert_eq!(store.get(&client(1)).unwrap().last_renewed_at, alloc.last_renewed_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("allocations.db");
        let alloc = Allocation::new(client(7), addr("2a03:b0c0:2:d0::1c0:f003"), 0);

        {
            let store = AllocationStore::open(Database::open(&path).unwrap()).unwrap();
            store.put(&alloc).unwrap();
            store.put(&Allocation::new(client(8), addr("2a03:b0c0:2:d0::1c0:f004"), 0)).unwrap();
            store.remove(&client(8)).unwrap();
        }

        let store = AllocationStore::open(Database::open(&path).unwrap()).unwrap();
        assert_eq!(store.get(&client(7)), Some(alloc));
        assert_eq!(store.get(&client(8)), None);
        assert_eq!(store.all().count(), 1);
    }

    #[test]
    fn test_corrupt_records_skipped() {
        let db = Database::open_memory().unwrap();
        {
            let store = AllocationStore::open(db.clone()).unwrap();
            store.put(&Allocation::new(client(1), addr("::1"), 0)).unwrap();
        }
        {
            let conn = db.connection();
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO allocations (client_id, address, record, updated_at) VALUES (?1, ?2, ?3, 0)",
                params!["garbage.k", "::2", "{not json"],
            )
            .unwrap();
            // Valid JSON whose key column disagrees with the record
            let mismatched = serde_json::to_string(&Allocation::new(client(3), addr("::3"), 0)).unwrap();
            conn.execute(
                "INSERT INTO allocations (client_id, address, record, updated_at) VALUES (?1, ?2, ?3, 0)",
                params![client(4).to_string(), "::3", mismatched],
            )
            .unwrap();
        }

        let store = AllocationStore::open(db).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&client(1)).is_some());
    }

    #[test]
    fn test_all_is_restartable() {
        let store = AllocationStore::open(Database::open_memory().unwrap()).unwrap();
        store.put(&Allocation::new(client(2), addr("::2"), 0)).unwrap();
        store.put(&Allocation::new(client(1), addr("::1"), 0)).unwrap();

        let first: Vec<_> = store.all().map(|a| a.address).collect();
        let second: Vec<_> = store.all().map(|a| a.address).collect();
        assert_eq!(first, vec![addr("::1"), addr("::2")]);
        assert_eq!(first, second);
    }

    // Setting the admin hash again replaces the old one
    #[test]
    fn test_admin_hash_replace() {
        let store = AllocationStore::open(Database::open_memory().unwrap()).unwrap();
        assert_eq!(store.admin_hash().unwrap(), None);

        for i in 0..2 {
            let hash = format!("hashNumber{}", i);
            store.set_admin_hash(&hash).unwrap();
            assert_eq!(store.admin_hash().unwrap(), Some(hash));
        }
    }
}
