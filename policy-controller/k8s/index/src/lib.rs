//! Translates `NetworkPolicy` watch events into reconciliation.
//!
//! The index records every parent policy it observes so that, when this
//! replica acquires the write lease, all parents can be reconciled without
//! waiting for the watch to resync. Entry points on the [`Orchestrator`] are
//! only invoked while the lease is held.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use groups_policy_controller_core::{Orchestrator, Parent};
use groups_policy_controller_k8s_api::policy::NetworkPolicy;
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, info};


pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    leader: watch::Receiver<bool>,
    orchestrator: Arc<Orchestrator>,
    policies: HashMap<ResourceId, Parent>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct ResourceId {
    namespace: String,
    name: String,
}

// === impl Index ===

impl Index {
    pub fn shared(leader: watch::Receiver<bool>, orchestrator: Arc<Orchestrator>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            leader,
            orchestrator,
            policies: HashMap::new(),
        }))
    }

    /// Reconciles all indexed parents whenever this replica becomes the
    /// leader and refreshes tracked parents periodically while it remains
    /// the leader.
    pub async fn run(index: SharedIndex, refresh_interval: time::Duration) {
        let mut leader = index.read().leader.clone();
        // The lease may have been acquired before this task started, in
        // which case no change will be observed for it.
        if *leader.borrow_and_update() {
            info!("Holding write lease; reconciling all policies");
            index.read().resync();
        }

        let mut refresh = time::interval(refresh_interval);
        refresh.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        refresh.tick().await;

        loop {
            tokio::select! {
                res = leader.changed() => {
                    if res.is_err() {
                        debug!("Lease claims closed");
                        return;
                    }
                    if *leader.borrow_and_update() {
                        info!("Acquired write lease; reconciling all policies");
                        index.read().resync();
                    }
                }
                _ = refresh.tick() => index.read().refresh(),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    fn resync(&self) {
        if !self.is_leader() {
            return;
        }
        // Events may have been missed while another replica held the lease,
        // so parents without group rules may still have derivatives.
        for parent in self.policies.values() {
            self.orchestrator.on_resync(parent.clone());
        }
    }

    fn refresh(&self) {
        if !self.is_leader() {
            return;
        }
        debug!(policies = self.policies.len(), "Refreshing groups");
        self.orchestrator.refresh(self.policies.values().cloned());
    }
}

impl kubert::index::IndexNamespacedResource<NetworkPolicy> for Index {
    fn apply(&mut self, policy: NetworkPolicy) {
        let parent = match Parent::try_from(policy) {
            Ok(parent) => parent,
            Err(error) => {
                info!(%error, "Ignoring NetworkPolicy");
                return;
            }
        };
        let id = ResourceId {
            namespace: parent.id().namespace.clone(),
            name: parent.id().name.clone(),
        };
        let leader = self.is_leader();

        match self.policies.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(parent.clone());
                if leader {
                    self.orchestrator.on_resync(parent);
                }
            }
            Entry::Occupied(mut entry) => {
                let old = entry.insert(parent.clone());
                if !leader {
                    return;
                }

                if old.id().uid != parent.id().uid {
                    // The policy was deleted and recreated between events.
                    self.orchestrator.on_delete_from_cache(&old);
                    self.orchestrator.on_add(parent);
                } else if old.policy().spec == parent.policy().spec {
                    debug!(namespace = %parent.id().namespace, name = %parent.id().name, "Spec unchanged");
                } else {
                    self.orchestrator.on_update(old, parent);
                }
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId { namespace, name };
        if let Some(parent) = self.policies.remove(&id) {
            self.orchestrator.on_delete_from_cache(&parent);
        }
    }
}
