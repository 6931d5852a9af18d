//! Contract-Net Protocol: task announcement, bid collection, and award.
//!
//! Implements the full announce → bid → award state machine: a
//! requester announces a task, candidates submit scored bids, and the
//! manager selects and awards a winner by a deterministic ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::identity::{now_epoch_ms, AgentId};

/// Default deadline for an announcement that doesn't specify one.
pub const DEFAULT_DEADLINE_MS: u64 = 30_000;

/// Default grace window `cleanup()` waits past a closed negotiation's
/// `closed_ms` before removing it.
pub const DEFAULT_CLEANUP_GRACE_MS: u64 = 5 * 60 * 1000;

/// An immutable offer of a task to the agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAnnouncement {
    pub announcement_id: String,
    pub task: serde_json::Value,
    pub requester_id: AgentId,
    pub deadline: u64,
    pub required_skills: std::collections::HashMap<String, f32>,
    pub required_tools: std::collections::HashSet<String>,
    pub required_location: Option<crate::capability::Vec3i>,
}

impl TaskAnnouncement {
    pub fn is_expired(&self) -> bool {
        now_epoch_ms() >= self.deadline
    }

    pub fn remaining_time_ms(&self) -> u64 {
        self.deadline.saturating_sub(now_epoch_ms())
    }
}

/// A bidder's structured offer for an announced task.
///
/// Equality and hashing are by `(announcement_id, bidder_id)` only: a
/// bid uniquely identifies one bidder's offer for one announcement,
/// regardless of how its score/estimate/confidence were computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBid {
    pub announcement_id: String,
    pub bidder_id: AgentId,
    pub score: f32,
    pub estimated_time_ms: u64,
    pub confidence: f32,
    pub capabilities: std::collections::HashMap<String, serde_json::Value>,
}

impl TaskBid {
    /// `(score * confidence) / max(1.0, estimated_seconds)` — the
    /// primary winner-selection ordering key.
    pub fn bid_value(&self) -> f64 {
        let estimated_seconds = self.estimated_time_ms as f64 / 1000.0;
        (self.score as f64 * self.confidence as f64) / estimated_seconds.max(1.0)
    }
}

impl PartialEq for TaskBid {
    fn eq(&self, other: &Self) -> bool {
        self.announcement_id == other.announcement_id && self.bidder_id == other.bidder_id
    }
}
impl Eq for TaskBid {}

/// Total order used by [`ContractNetManager::select_winner`]: higher
/// `bid_value` wins; ties break on faster `estimated_time_ms`, then
/// higher `confidence`, then ascending `bidder_id` for determinism.
fn compare_bids(a: &TaskBid, b: &TaskBid) -> std::cmp::Ordering {
    b.bid_value()
        .total_cmp(&a.bid_value())
        .then_with(|| a.estimated_time_ms.cmp(&b.estimated_time_ms))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.bidder_id.cmp(&b.bidder_id))
}

fn best_bid(bids: &[TaskBid]) -> Option<TaskBid> {
    bids.iter().min_by(|a, b| compare_bids(a, b)).cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    Announced,
    Bidding,
    Awarded,
    Completed,
    Failed,
    Expired,
}

impl NegotiationState {
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            NegotiationState::Awarded
                | NegotiationState::Completed
                | NegotiationState::Failed
                | NegotiationState::Expired
        )
    }
}

/// A single task's negotiation lifecycle: bids collected so far, the
/// current state, and (once awarded) the winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    pub announcement: TaskAnnouncement,
    pub bids: Vec<TaskBid>,
    pub state: NegotiationState,
    pub winning_bid: Option<TaskBid>,
    pub awarded_agent: Option<AgentId>,
    pub created_ms: u64,
    pub closed_ms: Option<u64>,
}

impl Negotiation {
    fn new(announcement: TaskAnnouncement) -> Self {
        Self {
            announcement,
            bids: Vec::new(),
            state: NegotiationState::Announced,
            winning_bid: None,
            awarded_agent: None,
            created_ms: now_epoch_ms(),
            closed_ms: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn has_bid_from(&self, bidder: AgentId) -> bool {
        self.bids.iter().any(|b| b.bidder_id == bidder)
    }
}

/// Observer for contract-net lifecycle events. Exceptions (panics, in
/// Rust) from any one listener are isolated — see [`crate::listener`].
pub trait ContractListener: Send + Sync {
    fn on_announcement(&self, _announcement: &TaskAnnouncement) {}
    fn on_bid_submitted(&self, _announcement_id: &str, _bid: &TaskBid) {}
    fn on_contract_awarded(&self, _announcement_id: &str, _bid: &TaskBid) {}
    fn on_negotiation_expired(&self, _announcement_id: &str) {}
}

fn random_hex6() -> String {
    let mut rng = rand::thread_rng();
    let value: u32 = rng.gen_range(0..0x0100_0000);
    format!("{:06x}", value)
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// Announcement / bid collection / award state machine.
///
/// All compound check-then-act sequences (`submit_bid`'s duplicate
/// check, `award_contract`'s closed-state check) run while holding the
/// `DashMap` entry's internal shard lock for the whole read-modify-write,
/// which is what prevents check-then-act races under concurrent submission.
pub struct ContractNetManager {
    negotiations: DashMap<String, Negotiation>,
    listeners: std::sync::RwLock<Vec<Arc<dyn ContractListener>>>,
    id_counter: AtomicU64,
}

impl Default for ContractNetManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractNetManager {
    pub fn new() -> Self {
        Self {
            negotiations: DashMap::new(),
            listeners: std::sync::RwLock::new(Vec::new()),
            id_counter: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ContractListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    fn notify<F: Fn(&dyn ContractListener)>(&self, call: F) {
        let listeners = self.listeners.read().unwrap().clone();
        crate::listener::notify_listeners(&listeners, call);
    }

    fn fresh_announcement_id(&self) -> String {
        let seq = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "ann_{}{}_{}",
            base36(now_epoch_ms()),
            base36(seq),
            random_hex6()
        )
    }

    /// Announce a task; returns the fresh announcement id.
    pub fn announce_task(
        &self,
        task: serde_json::Value,
        requester: AgentId,
        deadline_ms: Option<u64>,
    ) -> String {
        let announcement = TaskAnnouncement {
            announcement_id: self.fresh_announcement_id(),
            task,
            requester_id: requester,
            deadline: now_epoch_ms() + deadline_ms.unwrap_or(DEFAULT_DEADLINE_MS),
            required_skills: std::collections::HashMap::new(),
            required_tools: std::collections::HashSet::new(),
            required_location: None,
        };
        self.announce(announcement)
    }

    /// Announce a fully-populated [`TaskAnnouncement`] (used when the
    /// caller needs required skills/tools/location, which
    /// `announce_task` leaves empty for the common case).
    pub fn announce(&self, announcement: TaskAnnouncement) -> String {
        let id = announcement.announcement_id.clone();
        info!(announcement_id = %id, requester = %announcement.requester_id, "task announced");
        self.negotiations.insert(id.clone(), Negotiation::new(announcement.clone()));
        self.notify(|l| l.on_announcement(&announcement));
        id
    }

    /// Expire `negotiation` in place if its deadline has passed and it
    /// is still open. Returns the announcement id if a transition just
    /// happened, so the caller can fire `on_negotiation_expired` itself
    /// *after* dropping its `DashMap` entry guard — never while the
    /// shard write lock is held, or a listener that reenters the
    /// manager on the same entry (e.g. `submit_bid`, `state_of`,
    /// `negotiation`) would deadlock.
    fn expire_if_due(&self, negotiation: &mut Negotiation) -> Option<String> {
        if !negotiation.is_closed() && negotiation.announcement.is_expired() {
            negotiation.state = NegotiationState::Expired;
            negotiation.closed_ms = Some(now_epoch_ms());
            Some(negotiation.announcement.announcement_id.clone())
        } else {
            None
        }
    }

    /// Fires `on_negotiation_expired` for `id`. Callers must invoke
    /// this only after releasing any `DashMap` entry guard they held
    /// while detecting the expiry.
    fn notify_expired(&self, id: &str) {
        warn!(announcement_id = %id, "negotiation expired");
        self.notify(|l| l.on_negotiation_expired(id));
    }

    /// Submit a bid. Returns `false` for every soft rejection (unknown
    /// id, closed negotiation, expired deadline, duplicate bidder);
    /// `true` once the bid is recorded.
    pub fn submit_bid(&self, bid: TaskBid) -> bool {
        let Some(mut negotiation) = self.negotiations.get_mut(&bid.announcement_id) else {
            debug!(announcement_id = %bid.announcement_id, "bid rejected: unknown announcement");
            return false;
        };

        let expired = self.expire_if_due(&mut negotiation);

        if negotiation.is_closed() {
            drop(negotiation);
            if let Some(id) = expired {
                self.notify_expired(&id);
            }
            debug!(announcement_id = %bid.announcement_id, "bid rejected: negotiation closed");
            return false;
        }

        if negotiation.has_bid_from(bid.bidder_id) {
            debug!(bidder = %bid.bidder_id, "bid rejected: duplicate bidder");
            return false;
        }

        let first_bid = negotiation.bids.is_empty();
        negotiation.bids.push(bid.clone());
        if first_bid {
            negotiation.state = NegotiationState::Bidding;
        }
        let id = negotiation.announcement.announcement_id.clone();
        drop(negotiation);

        self.notify(|l| l.on_bid_submitted(&id, &bid));
        true
    }

    /// The best bid by [`compare_bids`]'s total order, without mutating
    /// state. `None` if the announcement is unknown or has no bids.
    pub fn select_winner(&self, announcement_id: &str) -> Option<TaskBid> {
        let negotiation = self.negotiations.get(announcement_id)?;
        best_bid(&negotiation.bids)
    }

    /// Award `bid` (which must already be present in the negotiation)
    /// to its bidder. Fails (returns `false`) if the bid isn't present,
    /// the negotiation is already closed, or it has expired.
    pub fn award_contract(&self, announcement_id: &str, bid: &TaskBid) -> bool {
        let Some(mut negotiation) = self.negotiations.get_mut(announcement_id) else {
            return false;
        };

        let expired = self.expire_if_due(&mut negotiation);

        if negotiation.is_closed() {
            drop(negotiation);
            if let Some(id) = expired {
                self.notify_expired(&id);
            }
            return false;
        }

        if !negotiation.bids.iter().any(|b| b == bid) {
            return false;
        }

        negotiation.state = NegotiationState::Awarded;
        negotiation.winning_bid = Some(bid.clone());
        negotiation.awarded_agent = Some(bid.bidder_id);
        negotiation.closed_ms = Some(now_epoch_ms());
        let id = negotiation.announcement.announcement_id.clone();
        let awarded_bid = bid.clone();
        drop(negotiation);

        info!(announcement_id = %id, winner = %awarded_bid.bidder_id, "contract awarded");
        self.notify(|l| l.on_contract_awarded(&id, &awarded_bid));
        true
    }

    /// Compound of [`Self::select_winner`] + [`Self::award_contract`].
    pub fn award_to_best_bidder(&self, announcement_id: &str) -> Option<TaskBid> {
        let winner = self.select_winner(announcement_id)?;
        if self.award_contract(announcement_id, &winner) {
            Some(winner)
        } else {
            None
        }
    }

    /// Force a negotiation into a terminal state. No-op on an unknown
    /// id.
    pub fn close_negotiation(&self, announcement_id: &str, state: NegotiationState) {
        if let Some(mut negotiation) = self.negotiations.get_mut(announcement_id) {
            negotiation.state = state;
            negotiation.closed_ms = Some(now_epoch_ms());
        }
    }

    /// Current state, if the announcement is known.
    pub fn state_of(&self, announcement_id: &str) -> Option<NegotiationState> {
        let mut negotiation = self.negotiations.get_mut(announcement_id)?;
        let expired = self.expire_if_due(&mut negotiation);
        let state = negotiation.state;
        drop(negotiation);
        if let Some(id) = expired {
            self.notify_expired(&id);
        }
        Some(state)
    }

    pub fn negotiation(&self, announcement_id: &str) -> Option<Negotiation> {
        self.negotiations.get(announcement_id).map(|n| n.clone())
    }

    /// Remove negotiations that are expired-past-deadline, or closed
    /// and older than `grace_ms` since `closed_ms`. Returns the count
    /// removed. Removing a negotiation removes its bids with it —
    /// there is no separate bid-retention policy.
    pub fn cleanup(&self, grace_ms: u64) -> usize {
        let now = now_epoch_ms();
        let stale: Vec<String> = self
            .negotiations
            .iter()
            .filter(|entry| {
                let n = entry.value();
                match n.state {
                    NegotiationState::Expired => true,
                    s if s.is_closed() => n
                        .closed_ms
                        .map(|closed| now.saturating_sub(closed) >= grace_ms)
                        .unwrap_or(false),
                    _ => false,
                }
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            self.negotiations.remove(id);
        }
        stale.len()
    }
}
