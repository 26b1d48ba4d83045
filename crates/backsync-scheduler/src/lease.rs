//! Exclusive execution leases for dispatch cycles.
//!
//! A dispatch cycle runs under an exclusive lease keyed by capacity pool, so
//! that concurrent dispatcher instances across worker processes cannot run
//! the same cycle twice. Acquisition is non-blocking: a contended lease means
//! someone else is already working and the cycle is a no-op. The holder
//! renews the lease periodically while work remains; an expired lease is
//! reacquirable by anyone.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use crate::error::LeaseError;

#[derive(Debug, Clone)]
struct LeaseRecord {
    lease_id: u64,
    holder: String,
    expires_at_us: u64,
}

/// Tracks exclusive leases by key.
pub struct LeaseManager {
    leases: RwLock<HashMap<String, LeaseRecord>>,
    next_lease_id: RwLock<u64>,
}

impl LeaseManager {
    /// Create an empty lease manager.
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            next_lease_id: RwLock::new(1),
        }
    }

    /// Try to acquire the lease for `key`. Non-blocking: returns
    /// `LeaseError::Held` if another holder owns an unexpired lease.
    /// Returns the lease ID on success.
    pub fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        duration_us: u64,
        now_us: u64,
    ) -> Result<u64, LeaseError> {
        let mut leases = self.leases.write().unwrap();

        if let Some(existing) = leases.get(key) {
            if existing.expires_at_us > now_us {
                return Err(LeaseError::Held {
                    key: key.to_string(),
                    holder: existing.holder.clone(),
                });
            }
        }

        let lease_id = {
            let mut next = self.next_lease_id.write().unwrap();
            let id = *next;
            *next += 1;
            id
        };

        leases.insert(
            key.to_string(),
            LeaseRecord {
                lease_id,
                holder: holder.to_string(),
                expires_at_us: now_us.saturating_add(duration_us),
            },
        );
        debug!(key = key, holder = holder, lease_id, "lease acquired");
        Ok(lease_id)
    }

    /// Extend a held lease to `now_us + duration_us`. Returns
    /// `LeaseError::NotHeld` if the lease expired or was released.
    pub fn renew(&self, lease_id: u64, duration_us: u64, now_us: u64) -> Result<(), LeaseError> {
        let mut leases = self.leases.write().unwrap();
        for record in leases.values_mut() {
            if record.lease_id == lease_id {
                if record.expires_at_us <= now_us {
                    return Err(LeaseError::NotHeld { lease_id });
                }
                record.expires_at_us = now_us.saturating_add(duration_us);
                return Ok(());
            }
        }
        Err(LeaseError::NotHeld { lease_id })
    }

    /// Release a lease. Returns true if it was held.
    pub fn release(&self, lease_id: u64) -> bool {
        let mut leases = self.leases.write().unwrap();
        let key = leases
            .iter()
            .find(|(_, record)| record.lease_id == lease_id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                leases.remove(&key);
                debug!(key = %key, lease_id, "lease released");
                true
            }
            None => false,
        }
    }

    /// The current holder of `key`, if the lease is unexpired.
    pub fn holder_of(&self, key: &str, now_us: u64) -> Option<String> {
        let leases = self.leases.read().unwrap();
        leases
            .get(key)
            .filter(|record| record.expires_at_us > now_us)
            .map(|record| record.holder.clone())
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}
