// src/coordinator.rs

//! Per-IP lease accounting and the background coordinator that repairs it.
//!
//! Scanners claim a slot against the target's IP before probing and release
//! it afterwards, which caps concurrent probes against any single host across
//! every running instance. Crashed instances leak their claims; a single
//! elected leader sweeps slots that have not moved in a while and zeroes
//! them. Election and accounting both ride on [`KvStore`]'s revision CAS, so
//! two instances can never both believe they won.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::models::{IpLeaseSlot, LeaderRecord};
use crate::kv::{KvError, KvStore};

pub const LEADER_KEY: &str = "ip_cleanup_leader";
pub const SLOT_PREFIX: &str = "ip_slot:";

/// A leader that has not heartbeaten for this long is considered gone.
const LEADER_STALE_SECS: i64 = 60;
/// A claimed slot that has not moved for this long was leaked by a crash.
const SLOT_STALE_SECS: i64 = 90;
/// Heartbeat and sweep cadence; three missed beats cross the stale line.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Bounded CAS retries for claim/release contention on one slot.
const SLOT_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("stored record did not decode: {0}")]
    Decode(#[from] serde_json::Error),
}

fn slot_key(ip: &str) -> String {
    format!("{SLOT_PREFIX}{ip}")
}

/// The claim/release side, used by every scan worker.
pub struct IpLeasePool {
    store: Arc<dyn KvStore>,
    max_per_ip: u32,
}

impl IpLeasePool {
    pub fn new(store: Arc<dyn KvStore>, max_per_ip: u32) -> Self {
        Self { store, max_per_ip }
    }

    /// Tries to claim one probe slot against `ip`. `false` means the IP is
    /// saturated (or too contended to decide); the caller should requeue.
    pub async fn claim(&self, ip: &str) -> Result<bool, LeaseError> {
        let key = slot_key(ip);
        for _ in 0..SLOT_RETRIES {
            match self.store.get(&key).await? {
                None => {
                    let slot = IpLeaseSlot {
                        ip: ip.to_string(),
                        count: 1,
                        updated_at: Utc::now(),
                    };
                    if self
                        .store
                        .put_if_absent(&key, &serde_json::to_string(&slot)?)
                        .await?
                    {
                        return Ok(true);
                    }
                    // Someone created it first; re-read and go again.
                }
                Some(entry) => {
                    let mut slot: IpLeaseSlot = serde_json::from_str(&entry.value)?;
                    if slot.count >= self.max_per_ip {
                        debug!(ip, count = slot.count, "lease slot saturated");
                        return Ok(false);
                    }
                    slot.count += 1;
                    slot.updated_at = Utc::now();
                    if self
                        .store
                        .compare_and_swap(&key, &serde_json::to_string(&slot)?, entry.revision)
                        .await?
                    {
                        return Ok(true);
                    }
                }
            }
        }
        warn!(ip, "gave up claiming lease slot after repeated conflicts");
        Ok(false)
    }

    /// Returns a previously claimed slot. Releasing an already-empty slot is
    /// a no-op; the sweep may have zeroed it first.
    pub async fn release(&self, ip: &str) -> Result<(), LeaseError> {
        let key = slot_key(ip);
        for _ in 0..SLOT_RETRIES {
            let Some(entry) = self.store.get(&key).await? else {
                return Ok(());
            };
            let mut slot: IpLeaseSlot = serde_json::from_str(&entry.value)?;
            if slot.count == 0 {
                return Ok(());
            }
            slot.count -= 1;
            slot.updated_at = Utc::now();
            if self
                .store
                .compare_and_swap(&key, &serde_json::to_string(&slot)?, entry.revision)
                .await?
            {
                return Ok(());
            }
        }
        warn!(ip, "gave up releasing lease slot after repeated conflicts");
        Ok(())
    }
}

/// The elected side: one instance at a time heartbeats the leader key and
/// sweeps leaked slots.
pub struct LeaseCoordinator {
    store: Arc<dyn KvStore>,
    instance_id: String,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Claims or refreshes leadership. Create when absent; CAS-replace when
    /// we already lead (heartbeat) or the incumbent went stale (takeover).
    pub async fn try_acquire(&self) -> Result<bool, LeaseError> {
        let record = LeaderRecord {
            instance_id: self.instance_id.clone(),
            updated_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&record)?;

        match self.store.get(LEADER_KEY).await? {
            None => Ok(self.store.put_if_absent(LEADER_KEY, &encoded).await?),
            Some(entry) => {
                let current: LeaderRecord = serde_json::from_str(&entry.value)?;
                let age = (Utc::now() - current.updated_at).num_seconds();
                if current.instance_id == self.instance_id {
                    Ok(self
                        .store
                        .compare_and_swap(LEADER_KEY, &encoded, entry.revision)
                        .await?)
                } else if age > LEADER_STALE_SECS {
                    let won = self
                        .store
                        .compare_and_swap(LEADER_KEY, &encoded, entry.revision)
                        .await?;
                    if won {
                        info!(
                            instance_id = %self.instance_id,
                            previous = %current.instance_id,
                            stale_secs = age,
                            "took over lease coordination from stale leader"
                        );
                    }
                    Ok(won)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Zeroes every claimed slot whose last movement is older than the stale
    /// line. Only the current leader calls this.
    pub async fn sweep_stale_slots(&self) -> Result<usize, LeaseError> {
        let mut reclaimed = 0;
        for key in self.store.keys(SLOT_PREFIX).await? {
            let Some(entry) = self.store.get(&key).await? else {
                continue;
            };
            let slot: IpLeaseSlot = match serde_json::from_str(&entry.value) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(key, error = %e, "skipping undecodable lease slot");
                    continue;
                }
            };
            let age = (Utc::now() - slot.updated_at).num_seconds();
            if slot.count == 0 || age <= SLOT_STALE_SECS {
                continue;
            }
            let zeroed = IpLeaseSlot {
                count: 0,
                updated_at: Utc::now(),
                ..slot.clone()
            };
            if self
                .store
                .compare_and_swap(&key, &serde_json::to_string(&zeroed)?, entry.revision)
                .await?
            {
                info!(
                    ip = %slot.ip,
                    abandoned = slot.count,
                    stale_secs = age,
                    "reclaimed stale lease slot"
                );
                reclaimed += 1;
            } else {
                // The slot moved while we looked at it, so it is not stale.
                debug!(key, "lease slot changed under the sweep");
            }
        }
        Ok(reclaimed)
    }

    /// Heartbeat loop. Store errors are logged and retried next tick; the
    /// loop only ends on shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        info!(instance_id = %self.instance_id, "lease coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(instance_id = %self.instance_id, "lease coordinator stopping");
                    break;
                }
                _ = tick.tick() => {
                    match self.try_acquire().await {
                        Ok(true) => {
                            if let Err(e) = self.sweep_stale_slots().await {
                                warn!(error = %e, "stale slot sweep failed, will retry");
                            }
                        }
                        Ok(false) => debug!(instance_id = %self.instance_id, "not the leader this tick"),
                        Err(e) => warn!(error = %e, "leader heartbeat failed, will retry"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use chrono::Duration as ChronoDuration;

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemoryKvStore::new())
    }

    async fn plant_slot(store: &Arc<dyn KvStore>, ip: &str, count: u32, age_secs: i64) {
        let slot = IpLeaseSlot {
            ip: ip.to_string(),
            count,
            updated_at: Utc::now() - ChronoDuration::seconds(age_secs),
        };
        store
            .put_if_absent(&slot_key(ip), &serde_json::to_string(&slot).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claims_stop_at_the_cap() {
        let store = store();
        let pool = IpLeasePool::new(store, 2);

        assert!(pool.claim("203.0.113.9").await.unwrap());
        assert!(pool.claim("203.0.113.9").await.unwrap());
        assert!(!pool.claim("203.0.113.9").await.unwrap());

        pool.release("203.0.113.9").await.unwrap();
        assert!(pool.claim("203.0.113.9").await.unwrap());
    }

    #[tokio::test]
    async fn releasing_an_empty_slot_is_harmless() {
        let pool = IpLeasePool::new(store(), 2);
        pool.release("203.0.113.9").await.unwrap();
        assert!(pool.claim("203.0.113.9").await.unwrap());
    }

    #[tokio::test]
    async fn fresh_leader_blocks_takeover() {
        let store = store();
        let incumbent = LeaseCoordinator::new(store.clone());
        let challenger = LeaseCoordinator::new(store);

        assert!(incumbent.try_acquire().await.unwrap());
        assert!(!challenger.try_acquire().await.unwrap());
        // The incumbent's own heartbeat keeps succeeding.
        assert!(incumbent.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn stale_leader_is_replaced() {
        let store = store();
        let dead = LeaderRecord {
            instance_id: "gone".into(),
            updated_at: Utc::now() - ChronoDuration::seconds(LEADER_STALE_SECS + 10),
        };
        store
            .put_if_absent(LEADER_KEY, &serde_json::to_string(&dead).unwrap())
            .await
            .unwrap();

        let challenger = LeaseCoordinator::new(store.clone());
        assert!(challenger.try_acquire().await.unwrap());

        let entry = store.get(LEADER_KEY).await.unwrap().unwrap();
        let record: LeaderRecord = serde_json::from_str(&entry.value).unwrap();
        assert_eq!(record.instance_id, challenger.instance_id());
    }

    #[tokio::test]
    async fn sweep_zeroes_only_stale_claimed_slots() {
        let store = store();
        plant_slot(&store, "10.0.0.1", 3, SLOT_STALE_SECS + 30).await;
        plant_slot(&store, "10.0.0.2", 1, 5).await;
        plant_slot(&store, "10.0.0.3", 0, SLOT_STALE_SECS + 30).await;

        let coordinator = LeaseCoordinator::new(store.clone());
        assert!(coordinator.try_acquire().await.unwrap());
        assert_eq!(coordinator.sweep_stale_slots().await.unwrap(), 1);

        let stale = store.get(&slot_key("10.0.0.1")).await.unwrap().unwrap();
        let slot: IpLeaseSlot = serde_json::from_str(&stale.value).unwrap();
        assert_eq!(slot.count, 0);

        let fresh = store.get(&slot_key("10.0.0.2")).await.unwrap().unwrap();
        let slot: IpLeaseSlot = serde_json::from_str(&fresh.value).unwrap();
        assert_eq!(slot.count, 1);
    }

    #[tokio::test]
    async fn two_challengers_cannot_both_take_over() {
        let store = store();
        let dead = LeaderRecord {
            instance_id: "gone".into(),
            updated_at: Utc::now() - ChronoDuration::seconds(LEADER_STALE_SECS + 10),
        };
        store
            .put_if_absent(LEADER_KEY, &serde_json::to_string(&dead).unwrap())
            .await
            .unwrap();

        let a = LeaseCoordinator::new(store.clone());
        let b = LeaseCoordinator::new(store.clone());
        let a_won = a.try_acquire().await.unwrap();
        // The CAS revision moved, so the second challenger sees a fresh
        // record and backs off.
        let b_won = b.try_acquire().await.unwrap();
        assert!(a_won);
        assert!(!b_won);
    }
}
