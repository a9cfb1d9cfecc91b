// Joint-consensus membership changes.
//
// A configuration change never jumps straight from C_old to C_new: the
// leader first replicates the union C_old_new and requires majorities from
// BOTH C_old and C_new, then replicates C_new and requires a majority of
// C_new. A leader that is not part of C_new finishes the change and shuts
// itself down.

use crate::common::{NodeAddr, NodeId};
use crate::error::{RaftError, Result};
use crate::message::{AppendEntriesRequest, Entry, EntryType, NodeEvent};
use crate::node::{LeaderContext, RaftNode, Role};
use crate::peers::PeerRegistry;
use crate::replication::TrackedRole;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

impl RaftNode {
    /// Serve a ChangeConfig request on the leader. Only one membership
    /// change runs at a time, and never while a leadership transfer is
    /// pending.
    pub(crate) async fn leader_change_config(
        &mut self,
        ctx: &mut LeaderContext,
        new_peers: HashMap<NodeId, NodeAddr>,
    ) -> Result<()> {
        if ctx.config_changing {
            return Err(RaftError::MembershipChangeInProgress);
        }
        if ctx.transfer_pending() {
            return Err(RaftError::TransferInProgress);
        }
        if new_peers.is_empty() {
            return Err(RaftError::InvalidState(
                "target configuration is empty".to_string(),
            ));
        }

        ctx.config_changing = true;
        let result = self.run_joint_consensus(ctx, new_peers).await;
        ctx.config_changing = false;
        result
    }

    async fn run_joint_consensus(
        &mut self,
        ctx: &mut LeaderContext,
        new_peers: HashMap<NodeId, NodeAddr>,
    ) -> Result<()> {
        let old_peers = self.peers.all();
        let old_ids: HashSet<NodeId> = old_peers.keys().cloned().collect();
        let new_ids: HashSet<NodeId> = new_peers.keys().cloned().collect();

        let mut union = old_peers.clone();
        union.extend(new_peers.iter().map(|(id, addr)| (id.clone(), addr.clone())));

        tracing::info!(
            node_id = %self.config.id,
            old = old_ids.len(),
            new = new_ids.len(),
            "starting joint-consensus membership change"
        );

        // Phase 1: C_old_new, committed under majorities of both halves.
        let entry = self
            .persistent
            .append_new(EntryType::ChangeConf, PeerRegistry::encode_peer_map(&union)?)?;
        self.peers.replace(union.clone());
        self.reconcile_trackers(ctx, &union);
        self.replicate_config_entry(ctx, &entry, &[&old_ids, &new_ids])
            .await?;

        // Phase 2: C_new, committed under a majority of the new cluster.
        let entry = self.persistent.append_new(
            EntryType::ChangeConf,
            PeerRegistry::encode_peer_map(&new_peers)?,
        )?;
        self.peers.replace(new_peers.clone());
        self.replicate_config_entry(ctx, &entry, &[&new_ids]).await?;

        // Both phases replicated: the whole change is committed.
        let last_index = self.persistent.last_index();
        self.volatile.advance_commit(last_index);
        self.apply_committed().await;

        if !new_peers.contains_key(&self.config.id) {
            tracing::info!(
                node_id = %self.config.id,
                "removed from cluster by membership change, shutting down"
            );
            let _ = self.event_tx.try_send(NodeEvent::RemovedFromCluster);
            self.set_role(Role::Stopped);
            return Ok(());
        }

        // Tear down replication to departed followers.
        ctx.trackers.retain(|id, tracker| {
            if new_ids.contains(id) {
                true
            } else {
                tracing::info!(node_id = %self.config.id, follower = %id, "dropping departed follower");
                tracker.stop();
                false
            }
        });

        tracing::info!(node_id = %self.config.id, members = new_ids.len(), "membership change committed");
        Ok(())
    }

    /// Make the tracker set match a configuration: every non-self member
    /// gets a replication worker.
    fn reconcile_trackers(&self, ctx: &mut LeaderContext, peers: &HashMap<NodeId, NodeAddr>) {
        for (id, addr) in peers {
            if *id == self.config.id || ctx.trackers.contains_key(id) {
                continue;
            }
            self.register_tracker(ctx, id.clone(), addr.clone(), TrackedRole::Follower);
            if let Some(tracker) = ctx.trackers.get(id) {
                tracker.trigger();
            }
        }
    }

    /// Replicate one ChangeConf entry until every listed quorum has a
    /// majority of acknowledgements, or the window closes.
    async fn replicate_config_entry(
        &mut self,
        ctx: &mut LeaderContext,
        entry: &Entry,
        quorums: &[&HashSet<NodeId>],
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.election_timeout_max;
        let mut acked: HashSet<NodeId> = HashSet::from([self.config.id.clone()]);

        loop {
            // Followers that converged through their workers count too.
            for tracker in ctx.trackers.values() {
                if tracker.match_index() >= entry.index {
                    acked.insert(tracker.id.clone());
                }
            }
            if quorums.iter().all(|quorum| has_majority(quorum, &acked)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout(
                    "membership change not acknowledged by the required majorities".to_string(),
                ));
            }

            let term = self.persistent.current_term();
            let req = AppendEntriesRequest {
                term,
                leader_id: self.config.id.clone(),
                prev_log_index: entry.index - 1,
                prev_log_term: self.persistent.term_at(entry.index - 1).unwrap_or(0),
                leader_commit: self.volatile.commit_index(),
                entries: vec![entry.clone()],
                entry_type: EntryType::ChangeConf,
            };
            let outcome = self
                .fan_out_append(ctx, req, self.config.heartbeat_interval)
                .await;
            if let Some(higher) = outcome.higher_term {
                self.step_down(higher);
                return Err(RaftError::NotLeader {
                    leader_hint: self.peers.leader_id(),
                });
            }
            acked.extend(outcome.acked);
            if quorums.iter().all(|quorum| has_majority(quorum, &acked)) {
                return Ok(());
            }

            // Stragglers catch up through their workers before the retry.
            for tracker in ctx.trackers.values() {
                if !acked.contains(&tracker.id) {
                    tracker.trigger();
                }
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
    }
}

/// Whether `acked` contains a majority of `quorum`.
fn has_majority(quorum: &HashSet<NodeId>, acked: &HashSet<NodeId>) -> bool {
    if quorum.is_empty() {
        return true;
    }
    acked.intersection(quorum).count() >= quorum.len() / 2 + 1
}
