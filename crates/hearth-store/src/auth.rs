use hearth_core::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

/// Users table: username -> bcrypt hash
const USERS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("users");

/// Operator account storage. The admin UI itself lives outside this
/// codebase; this store only provides salted-hash credential checks.
#[derive(Clone)]
pub struct AuthStore {
    db: Arc<Database>,
}

impl AuthStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn user_exists(&self) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        let mut users = table.iter()?;
        let exists = users.next().is_some();
        Ok(exists)
    }

    pub fn create_user(&self, username: &str, password: &str) -> Result<()> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| Error::Store(e.to_string()))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS_TABLE)?;
            table.insert(username, hash.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Verify a credential pair. An unknown username verifies false rather
    /// than erroring, so callers cannot probe for account names.
    pub fn verify(&self, username: &str, password: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;

        let hash = match table.get(username)? {
            Some(v) => v.value().to_string(),
            None => return Ok(false),
        };

        bcrypt::verify(password, &hash).map_err(|e| Error::Store(e.to_string()))
    }
}
