//! [`OwnershipRegistry`] implementation over a Fjall keyspace.

use std::path::Path;
use std::sync::Mutex;

use atlas_types::{AccessKey, Customer, DatasourceId};
use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tracing::{debug, info, warn};

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Collisions on a 62^12 key space are not expected; give up rather than spin.
const MAX_KEY_ATTEMPTS: usize = 8;

/// Customer ownership registry backed by Fjall.
///
/// Reads go straight to the keyspace. Read-modify-write cycles on a record
/// hold `write_lock` so concurrent grants to one key cannot lose updates.
pub struct OwnershipRegistry {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// AccessKey -> JSON-encoded Customer.
    apikeys: Keyspace,
    write_lock: Mutex<()>,
}

impl OwnershipRegistry {
    /// Open a persistent registry at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary registry that is cleaned up on drop.
    ///
    /// Useful for tests and `--memory` mode.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let apikeys = db.keyspace("apikeys", KeyspaceCreateOptions::default)?;
        Ok(Self {
            db,
            apikeys,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ----- Reads -----

    fn load(&self, key: &AccessKey) -> Result<Option<Customer>> {
        match self.apikeys.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Retrieve a customer by access key.
    pub fn get_customer(&self, key: &AccessKey) -> Result<Customer> {
        self.load(key)?
            .ok_or_else(|| MetaError::CustomerNotFound(key.clone()))
    }

    /// Whether `key` owns `id`. An unknown key yields `CustomerNotFound`.
    pub fn is_owner(&self, key: &AccessKey, id: &DatasourceId) -> Result<bool> {
        Ok(self.get_customer(key)?.has_datasource(id))
    }

    /// List every registered access key.
    pub fn list_customers(&self) -> Result<Vec<AccessKey>> {
        let mut keys = Vec::new();
        for guard in self.apikeys.iter() {
            let k = guard.key()?;
            keys.push(AccessKey::from(String::from_utf8_lossy(&k).into_owned()));
        }
        Ok(keys)
    }

    /// All access keys whose record lists `id`. Full scan.
    pub fn owners_of(&self, id: &DatasourceId) -> Result<Vec<AccessKey>> {
        let mut owners = Vec::new();
        for guard in self.apikeys.iter() {
            let v = guard.value()?;
            let customer: Customer = serde_json::from_slice(&v)?;
            if customer.has_datasource(id) {
                owners.push(customer.apikey);
            }
        }
        Ok(owners)
    }

    // ----- Writes -----

    fn store(&self, customer: &Customer) -> Result<()> {
        let value = serde_json::to_vec(customer)?;
        self.apikeys
            .insert(customer.apikey.as_bytes(), value.as_slice())?;
        Ok(())
    }

    /// Issue a fresh access key and persist an empty customer for it.
    pub fn create_customer(&self) -> Result<Customer> {
        let _guard = self.lock();
        for _ in 0..MAX_KEY_ATTEMPTS {
            let key = AccessKey::generate();
            if self.load(&key)?.is_some() {
                warn!(apikey = %key, "generated access key collided, retrying");
                continue;
            }
            let customer = Customer::new(key);
            self.store(&customer)?;
            info!(apikey = %customer.apikey, "created customer");
            return Ok(customer);
        }
        Err(MetaError::Io(std::io::Error::other(
            "could not generate a unique access key",
        )))
    }

    /// Upsert a full customer record (administrative import).
    ///
    /// Duplicate datasource ids in the supplied record are collapsed.
    pub fn put_customer(&self, customer: &Customer) -> Result<()> {
        let _guard = self.lock();
        let mut customer = customer.clone();
        customer.dedup_datasources();
        self.store(&customer)?;
        debug!(apikey = %customer.apikey, datasources = customer.datasources.len(), "stored customer");
        Ok(())
    }

    /// Grant `id` to `key`. Granting an already-owned id is a no-op.
    pub fn add_datasource(&self, key: &AccessKey, id: &DatasourceId) -> Result<Customer> {
        let _guard = self.lock();
        let mut customer = self.get_customer(key)?;
        if customer.add_datasource(id.clone()) {
            self.store(&customer)?;
            debug!(apikey = %key, datasource = %id, "granted datasource");
        }
        Ok(customer)
    }

    /// Revoke `id` from `key`. Revoking an absent id is a no-op.
    pub fn remove_datasource(&self, key: &AccessKey, id: &DatasourceId) -> Result<Customer> {
        let _guard = self.lock();
        let mut customer = self.get_customer(key)?;
        if customer.remove_datasource(id) {
            self.store(&customer)?;
            debug!(apikey = %key, datasource = %id, "revoked datasource");
        }
        Ok(customer)
    }
}
