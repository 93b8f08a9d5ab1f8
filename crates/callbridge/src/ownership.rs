//! Single-owner election among the local contexts of one initiating device.
//!
//! The most recent claim for a device wins. Issuing a claim revokes the prior
//! one before `claim` returns, so the previous holder can abort in-flight work
//! at its next suspension point. Claim and release notifications are published
//! on an in-process topic channel scoped to this arbiter.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::ids::{ContextId, DeviceId};

pub type ClaimId = u64;

/// Why a claim stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    Superseded { by: ClaimId },
    Released,
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OwnershipDenied {
    #[error("ownership arbiter is closed")]
    Closed,
    #[error("context already holds claim {claim_id} for this device")]
    AlreadyHeld { claim_id: ClaimId },
}

/// A lease naming the context allowed to drive calls for a device.
///
/// Two claims are equal when they carry the same claim id.
#[derive(Debug, Clone)]
pub struct OwnershipClaim {
    claim_id: ClaimId,
    context_id: ContextId,
    device_id: DeviceId,
    claimed_at: DateTime<Utc>,
    revoked: watch::Receiver<Option<Revocation>>,
}

impl PartialEq for OwnershipClaim {
    fn eq(&self, other: &Self) -> bool {
        self.claim_id == other.claim_id
    }
}

impl Eq for OwnershipClaim {}

impl OwnershipClaim {
    pub fn claim_id(&self) -> ClaimId {
        self.claim_id
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    /// Current revocation, if any. Does not consult the arbiter.
    pub fn revocation(&self) -> Option<Revocation> {
        *self.revoked.borrow()
    }

    /// Resolves once the claim has been revoked.
    pub async fn revoked(&self) -> Revocation {
        let mut rx = self.revoked.clone();
        loop {
            if let Some(revocation) = *rx.borrow_and_update() {
                return revocation;
            }
            if rx.changed().await.is_err() {
                let last = *rx.borrow();
                return last.unwrap_or(Revocation::Closed);
            }
        }
    }
}

/// The claim that was displaced by a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersededClaim {
    pub claim_id: ClaimId,
    pub context_id: ContextId,
}

#[derive(Debug)]
pub struct ClaimGrant {
    pub claim: OwnershipClaim,
    pub superseded: Option<SupersededClaim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSummary {
    pub claim_id: ClaimId,
    pub context_id: ContextId,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipEvent {
    Claimed {
        device_id: DeviceId,
        context_id: ContextId,
        claim_id: ClaimId,
    },
    Superseded {
        device_id: DeviceId,
        context_id: ContextId,
        claim_id: ClaimId,
        by: ClaimId,
    },
    Released {
        device_id: DeviceId,
        context_id: ContextId,
        claim_id: ClaimId,
    },
}

/// In-process topic channel for ownership notifications. Never leaves the device.
#[derive(Debug, Default)]
pub struct OwnershipChannel {
    topics: RwLock<HashMap<String, broadcast::Sender<OwnershipEvent>>>,
}

impl OwnershipChannel {
    fn topic(device_id: &DeviceId) -> String {
        format!("ownership/{device_id}")
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<OwnershipEvent> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    pub fn subscribe(&self, device_id: &DeviceId) -> broadcast::Receiver<OwnershipEvent> {
        self.sender_for(&Self::topic(device_id)).subscribe()
    }

    fn publish(&self, device_id: &DeviceId, event: OwnershipEvent) {
        // No subscribers is fine; the revocation watch is the authoritative signal.
        let _ = self.sender_for(&Self::topic(device_id)).send(event);
    }
}

struct ActiveClaim {
    claim_id: ClaimId,
    context_id: ContextId,
    claimed_at: DateTime<Utc>,
    revoke_tx: watch::Sender<Option<Revocation>>,
}

#[derive(Default)]
pub struct OwnershipArbiter {
    next_claim: AtomicU64,
    slots: Mutex<HashMap<DeviceId, ActiveClaim>>,
    channel: OwnershipChannel,
    closed: AtomicBool,
}

impl OwnershipArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(
        &self,
        context_id: &ContextId,
        device_id: &DeviceId,
    ) -> Result<ClaimGrant, OwnershipDenied> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OwnershipDenied::Closed);
        }

        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(device_id) {
            if existing.context_id == *context_id {
                return Err(OwnershipDenied::AlreadyHeld {
                    claim_id: existing.claim_id,
                });
            }
        }

        // Allocated under the slot lock so ids order the same way supersession does.
        let claim_id = self.next_claim.fetch_add(1, Ordering::SeqCst) + 1;
        let claimed_at = Utc::now();
        let (revoke_tx, revoked) = watch::channel(None);
        let previous = slots.insert(
            device_id.clone(),
            ActiveClaim {
                claim_id,
                context_id: context_id.clone(),
                claimed_at,
                revoke_tx,
            },
        );
        drop(slots);

        let superseded = previous.map(|prev| {
            prev.revoke_tx
                .send_replace(Some(Revocation::Superseded { by: claim_id }));
            info!(
                target = "callbridge::ownership",
                device = %device_id,
                previous_context = %prev.context_id,
                previous_claim = prev.claim_id,
                claim_id,
                "ownership superseded"
            );
            self.channel.publish(
                device_id,
                OwnershipEvent::Superseded {
                    device_id: device_id.clone(),
                    context_id: prev.context_id.clone(),
                    claim_id: prev.claim_id,
                    by: claim_id,
                },
            );
            SupersededClaim {
                claim_id: prev.claim_id,
                context_id: prev.context_id,
            }
        });

        debug!(
            target = "callbridge::ownership",
            device = %device_id,
            context = %context_id,
            claim_id,
            "ownership claimed"
        );
        self.channel.publish(
            device_id,
            OwnershipEvent::Claimed {
                device_id: device_id.clone(),
                context_id: context_id.clone(),
                claim_id,
            },
        );

        Ok(ClaimGrant {
            claim: OwnershipClaim {
                claim_id,
                context_id: context_id.clone(),
                device_id: device_id.clone(),
                claimed_at,
                revoked,
            },
            superseded,
        })
    }

    /// Drops the claim if it is still current. Returns whether anything was released.
    pub fn release(&self, claim: &OwnershipClaim) -> bool {
        let mut slots = self.slots.lock();
        let current = slots
            .get(&claim.device_id)
            .is_some_and(|active| active.claim_id == claim.claim_id);
        if !current {
            return false;
        }
        let Some(active) = slots.remove(&claim.device_id) else {
            return false;
        };
        drop(slots);

        active.revoke_tx.send_replace(Some(Revocation::Released));
        debug!(
            target = "callbridge::ownership",
            device = %claim.device_id,
            claim_id = claim.claim_id,
            "ownership released"
        );
        self.channel.publish(
            &claim.device_id,
            OwnershipEvent::Released {
                device_id: claim.device_id.clone(),
                context_id: active.context_id,
                claim_id: active.claim_id,
            },
        );
        true
    }

    pub fn is_owner(&self, claim: &OwnershipClaim) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.slots
            .lock()
            .get(&claim.device_id)
            .is_some_and(|active| active.claim_id == claim.claim_id)
    }

    pub fn current(&self, device_id: &DeviceId) -> Option<ClaimSummary> {
        self.slots.lock().get(device_id).map(|active| ClaimSummary {
            claim_id: active.claim_id,
            context_id: active.context_id.clone(),
            claimed_at: active.claimed_at,
        })
    }

    pub fn subscribe(&self, device_id: &DeviceId) -> broadcast::Receiver<OwnershipEvent> {
        self.channel.subscribe(device_id)
    }

    /// Revokes every claim and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<ActiveClaim> = self.slots.lock().drain().map(|(_, v)| v).collect();
        for active in drained {
            active.revoke_tx.send_replace(Some(Revocation::Closed));
        }
    }
}
