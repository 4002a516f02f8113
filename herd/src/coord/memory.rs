//! In-process lock service.
//!
//! Implements the coordination contract with a process-local lock table:
//! the natural backend for tests, and good enough for deployments where
//! liveness never needs to leave the host. Clones share the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{KvClient, KvError, Lease, LockHandle};

#[derive(Debug)]
struct LockRecord {
    lease_id: i64,
    label: String,
    deadline: Instant,
    ttl: Duration,
}

#[derive(Debug, Default)]
struct Table {
    locks: HashMap<String, LockRecord>,
    next_lease: i64,
    fault: Option<KvError>,
}

impl Table {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.locks.retain(|_, record| record.deadline > now);
    }

    fn take_fault(&mut self) -> Result<(), KvError> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Lock table living inside the current process.
#[derive(Clone)]
pub struct MemoryKvClient {
    table: Arc<Mutex<Table>>,
    timeout: Duration,
}

impl MemoryKvClient {
    pub fn new(timeout: Duration) -> Self {
        Self { table: Arc::new(Mutex::new(Table::default())), timeout }
    }

    /// Make the next client call fail with `err`. Test aid.
    pub fn inject_fault(&self, err: KvError) {
        self.table.lock().fault = Some(err);
    }

    /// Current holder label of `key`, if locked.
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut table = self.table.lock();
        table.purge_expired();
        table.locks.get(key).map(|record| record.label.clone())
    }
}

impl Default for MemoryKvClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl KvClient for MemoryKvClient {
    fn acquire(&self, key: &str, ttl: Duration, label: &str) -> Result<LockHandle, KvError> {
        let mut table = self.table.lock();
        table.take_fault()?;
        table.purge_expired();
        if table.locks.contains_key(key) {
            return Err(KvError::LockAlreadyOccupied { key: key.to_string() });
        }
        table.next_lease += 1;
        let lease_id = table.next_lease;
        table.locks.insert(
            key.to_string(),
            LockRecord {
                lease_id,
                label: label.to_string(),
                deadline: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(LockHandle { id: lease_id, key: key.to_string() })
    }

    fn refresh(&self, lock: &LockHandle) -> Result<(), KvError> {
        let mut table = self.table.lock();
        table.take_fault()?;
        table.purge_expired();
        match table.locks.get_mut(&lock.key) {
            Some(record) if record.lease_id == lock.id => {
                record.deadline = Instant::now() + record.ttl;
                Ok(())
            }
            _ => Err(KvError::LockExpired),
        }
    }

    fn release(&self, lock: &LockHandle) -> Result<(), KvError> {
        let mut table = self.table.lock();
        table.take_fault()?;
        match table.locks.get(&lock.key) {
            Some(record) if record.lease_id == lock.id => {
                table.locks.remove(&lock.key);
                Ok(())
            }
            _ => Err(KvError::LockExpired),
        }
    }

    fn lease(&self, lease_id: i64) -> Result<Lease, KvError> {
        let mut table = self.table.lock();
        table.take_fault()?;
        table.purge_expired();
        let keys: Vec<String> = table
            .locks
            .iter()
            .filter(|(_, record)| record.lease_id == lease_id)
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return Err(KvError::LeaseExpired { id: lease_id });
        }
        Ok(Lease { id: lease_id, keys })
    }

    fn lock_from_lease(&self, lease: &Lease) -> Result<LockHandle, KvError> {
        match lease.keys.first() {
            Some(key) => Ok(LockHandle { id: lease.id, key: key.clone() }),
            None => Err(KvError::LeaseExpired { id: lease.id }),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
