use crate::{KVStore, Keyspace, Result, StorageError, Transaction as KVTransaction};
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const OBJECTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");
const INDICES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("indices");

fn table_for(space: Keyspace) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match space {
        Keyspace::Objects => OBJECTS_TABLE,
        Keyspace::Indices => INDICES_TABLE,
    }
}

fn table_name(space: Keyspace) -> &'static str {
    match space {
        Keyspace::Objects => "objects",
        Keyspace::Indices => "indices",
    }
}

/// Map a redb table or storage error onto the keyspace it hit
fn in_space<E: std::fmt::Display>(space: Keyspace) -> impl Fn(E) -> StorageError {
    move |e| StorageError::keyspace(table_name(space), e)
}

/// redb-based storage backend
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create the database file at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening redb database at: {}", path.display());

        let db = Database::create(path)
            .map_err(|e| StorageError::open(path.display().to_string(), e))?;

        let write_txn = db.begin_write()?;
        for space in [Keyspace::Objects, Keyspace::Indices] {
            write_txn
                .open_table(table_for(space))
                .map_err(in_space(space))?;
        }
        write_txn.commit()?;

        info!("redb database initialized successfully");

        Ok(Self { db: Arc::new(db) })
    }
}

impl KVStore for RedbBackend {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Bytes>> {
        debug!("Getting key: {:?}", String::from_utf8_lossy(key));

        let read_txn = self.db.begin_read()?;
        let table = read_txn
            .open_table(table_for(space))
            .map_err(in_space(space))?;

        let value = table.get(key).map_err(in_space(space))?;
        Ok(value.map(|v| Bytes::from(v.value().to_vec())))
    }

    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
        debug!("Putting key: {:?}", String::from_utf8_lossy(key));

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn
                .open_table(table_for(space))
                .map_err(in_space(space))?;
            table.insert(key, value).map_err(in_space(space))?;
        }
        write_txn.commit()?;

        Ok(())
    }

    fn delete(&self, space: Keyspace, key: &[u8]) -> Result<()> {
        debug!("Deleting key: {:?}", String::from_utf8_lossy(key));

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn
                .open_table(table_for(space))
                .map_err(in_space(space))?;
            table.remove(key).map_err(in_space(space))?;
        }
        write_txn.commit()?;

        Ok(())
    }

    fn scan(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        debug!(
            "Scanning with prefix: {:?}",
            String::from_utf8_lossy(prefix)
        );

        let read_txn = self.db.begin_read()?;
        let table = read_txn
            .open_table(table_for(space))
            .map_err(in_space(space))?;

        let mut results = Vec::new();

        // Keys are ordered, so stop at the first key past the prefix
        for entry in table.range::<&[u8]>(prefix..).map_err(in_space(space))? {
            let (key, value) = entry.map_err(in_space(space))?;
            let key_bytes = key.value();
            if !key_bytes.starts_with(prefix) {
                break;
            }
            results.push((
                Bytes::from(key_bytes.to_vec()),
                Bytes::from(value.value().to_vec()),
            ));
        }

        debug!("Scan found {} results", results.len());
        Ok(results)
    }

    fn exists(&self, space: Keyspace, key: &[u8]) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn
            .open_table(table_for(space))
            .map_err(in_space(space))?;
        Ok(table.get(key).map_err(in_space(space))?.is_some())
    }

    fn transaction(&self) -> Result<Box<dyn KVTransaction>> {
        let write_txn = self.db.begin_write()?;
        Ok(Box::new(RedbTransaction {
            txn: Some(write_txn),
        }))
    }
}

/// redb transaction implementation
struct RedbTransaction {
    txn: Option<redb::WriteTransaction>,
}

impl RedbTransaction {
    fn txn(&self) -> Result<&redb::WriteTransaction> {
        self.txn.as_ref().ok_or(StorageError::TransactionClosed)
    }
}

impl KVTransaction for RedbTransaction {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Bytes>> {
        let table = self
            .txn()?
            .open_table(table_for(space))
            .map_err(in_space(space))?;

        let value = table.get(key).map_err(in_space(space))?;
        Ok(value.map(|v| Bytes::from(v.value().to_vec())))
    }

    fn put(&mut self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self
            .txn()?
            .open_table(table_for(space))
            .map_err(in_space(space))?;
        table.insert(key, value).map_err(in_space(space))?;

        Ok(())
    }

    fn delete(&mut self, space: Keyspace, key: &[u8]) -> Result<()> {
        let mut table = self
            .txn()?
            .open_table(table_for(space))
            .map_err(in_space(space))?;
        table.remove(key).map_err(in_space(space))?;

        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let txn = self.txn.take().ok_or(StorageError::TransactionClosed)?;
        txn.commit()?;

        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        let txn = self.txn.take().ok_or(StorageError::TransactionClosed)?;
        txn.abort()
            .map_err(|e| StorageError::transaction(format!("abort: {}", e)))?;

        Ok(())
    }
}

impl Drop for RedbTransaction {
    fn drop(&mut self) {
        // Auto-rollback if not committed
        if let Some(txn) = self.txn.take() {
            let _ = txn.abort();
        }
    }
}
