//! Thread-safe index of agents and their declared capabilities:
//! registration, skill/radius/availability queries, and best-match
//! selection.
//!
//! Backed by per-entry `DashMap` concurrency rather than a single
//! `RwLock<HashMap<...>>` so registration and lookup don't serialize on
//! one global lock; compound check-then-act sequences still run inside
//! a single entry operation to stay race-free.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::capability::{Capability, CapabilitySnapshot, Vec3i};
use crate::error::CoreError;
use crate::identity::AgentId;

/// Weight of the skill term in [`CapabilityRegistry::find_best_agent`]
/// when a task position is supplied.
const WEIGHT_SKILLS: f32 = 0.5;
const WEIGHT_LOAD: f32 = 0.3;
const WEIGHT_DISTANCE: f32 = 0.2;
const BEST_AGENT_MAX_RANGE: f64 = 128.0;

/// Observer for registry lifecycle events.
pub trait CapabilityListener: Send + Sync {
    fn on_agent_registered(&self, _agent_id: AgentId, _capability: &CapabilitySnapshot) {}
    fn on_agent_unregistered(&self, _agent_id: AgentId) {}
    fn on_position_changed(&self, _agent_id: AgentId, _position: Vec3i) {}
    fn on_load_changed(&self, _agent_id: AgentId, _load: f32) {}
    fn on_capabilities_updated(&self, _agent_id: AgentId, _capability: &CapabilitySnapshot) {}
}

/// Concurrent index of registered agents.
pub struct CapabilityRegistry {
    by_id: DashMap<AgentId, Arc<Capability>>,
    by_lower_name: DashMap<String, AgentId>,
    listeners: RwLock<Vec<Arc<dyn CapabilityListener>>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_lower_name: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CapabilityListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    fn notify<F: Fn(&dyn CapabilityListener)>(&self, call: F) {
        let listeners = self.listeners.read().unwrap().clone();
        crate::listener::notify_listeners(&listeners, call);
    }

    /// Registers `capability` under `id`. Fails with
    /// [`CoreError::Duplicate`] if `id` is already registered.
    pub fn register(&self, id: AgentId, capability: Arc<Capability>) -> Result<(), CoreError> {
        if self.by_id.contains_key(&id) {
            return Err(CoreError::Duplicate(id.to_string()));
        }
        let name_key = capability.agent_name().to_lowercase();
        self.by_id.insert(id, capability.clone());
        self.by_lower_name.insert(name_key, id);
        info!(agent_id = %id, "agent registered");
        let snapshot = capability.snapshot();
        self.notify(|l| l.on_agent_registered(id, &snapshot));
        Ok(())
    }

    /// Removes and returns the capability registered under `id`, if any.
    pub fn unregister(&self, id: AgentId) -> Option<Arc<Capability>> {
        let (_, capability) = self.by_id.remove(&id)?;
        let name_key = capability.agent_name().to_lowercase();
        self.by_lower_name.remove(&name_key);
        info!(agent_id = %id, "agent unregistered");
        self.notify(|l| l.on_agent_unregistered(id));
        Some(capability)
    }

    pub fn unregister_by_name(&self, name: &str) -> Option<Arc<Capability>> {
        let id = *self.by_lower_name.get(&name.to_lowercase())?;
        self.unregister(id)
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<Capability>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Capability>> {
        let id = *self.by_lower_name.get(&name.to_lowercase())?;
        self.get(id)
    }

    /// No-op on an unknown id.
    pub fn update_position(&self, id: AgentId, position: Vec3i) {
        if let Some(entry) = self.by_id.get(&id) {
            entry.value().update_position(position);
            self.notify(|l| l.on_position_changed(id, position));
        } else {
            debug!(agent_id = %id, "update_position on unknown agent ignored");
        }
    }

    pub fn update_load(&self, id: AgentId, load: f32) {
        if let Some(entry) = self.by_id.get(&id) {
            entry.value().update_load(load);
            let clamped = entry.value().snapshot().current_load;
            self.notify(|l| l.on_load_changed(id, clamped));
        } else {
            debug!(agent_id = %id, "update_load on unknown agent ignored");
        }
    }

    pub fn update_active(&self, id: AgentId, active: bool) {
        if let Some(entry) = self.by_id.get(&id) {
            entry.value().set_active(active);
            let snapshot = entry.value().snapshot();
            self.notify(|l| l.on_capabilities_updated(id, &snapshot));
        } else {
            debug!(agent_id = %id, "update_active on unknown agent ignored");
        }
    }

    fn all_snapshots(&self) -> Vec<CapabilitySnapshot> {
        self.by_id.iter().map(|entry| entry.value().snapshot()).collect()
    }

    /// Agents that have `skill` at all (any proficiency).
    pub fn find_capable_agents_with_skill(&self, skill: &str) -> Vec<CapabilitySnapshot> {
        self.all_snapshots()
            .into_iter()
            .filter(|c| c.has_skill(skill))
            .collect()
    }

    /// Agents meeting every skill/min-proficiency requirement. An
    /// empty or absent requirement map matches all agents.
    pub fn find_capable_agents(&self, required: &HashMap<String, f32>) -> Vec<CapabilitySnapshot> {
        if required.is_empty() {
            return self.all_snapshots();
        }
        self.all_snapshots()
            .into_iter()
            .filter(|c| {
                required.iter().all(|(skill, min_prof)| {
                    let key = skill.to_lowercase();
                    c.proficiencies.get(&key).copied().unwrap_or(0.0) >= *min_prof
                })
            })
            .collect()
    }

    /// Agents within `radius` of `center`. `radius == 0` includes
    /// agents at exactly that distance.
    pub fn get_nearby_agents(&self, center: Vec3i, radius: f64) -> Vec<CapabilitySnapshot> {
        self.all_snapshots()
            .into_iter()
            .filter(|c| c.current_position.distance_to(&center) <= radius)
            .collect()
    }

    pub fn get_available_agents(&self) -> Vec<CapabilitySnapshot> {
        self.all_snapshots().into_iter().filter(|c| c.is_available()).collect()
    }

    /// Active agents sorted ascending by `current_load`.
    pub fn get_agents_by_availability(&self) -> Vec<CapabilitySnapshot> {
        let mut active: Vec<CapabilitySnapshot> =
            self.all_snapshots().into_iter().filter(|c| c.active).collect();
        active.sort_by(|a, b| a.current_load.total_cmp(&b.current_load));
        active
    }

    /// Highest-scoring available agent meeting `required`, optionally
    /// scored against `task_pos`. Weights are skill 0.5 / load 0.3 /
    /// distance 0.2 when `task_pos` is given; otherwise the distance
    /// weight is redistributed proportionally across skill and load.
    pub fn find_best_agent(
        &self,
        required: &HashMap<String, f32>,
        task_pos: Option<Vec3i>,
    ) -> Option<CapabilitySnapshot> {
        let (w_skill, w_load, w_distance) = match task_pos {
            Some(_) => (WEIGHT_SKILLS, WEIGHT_LOAD, WEIGHT_DISTANCE),
            None => {
                let base = WEIGHT_SKILLS + WEIGHT_LOAD;
                (
                    WEIGHT_SKILLS + WEIGHT_DISTANCE * (WEIGHT_SKILLS / base),
                    WEIGHT_LOAD + WEIGHT_DISTANCE * (WEIGHT_LOAD / base),
                    0.0,
                )
            }
        };

        let candidates = self.find_capable_agents(required).into_iter().filter(|c| c.is_available());

        candidates
            .map(|c| {
                let skill_term = if required.is_empty() {
                    if c.proficiencies.is_empty() {
                        0.5
                    } else {
                        c.proficiencies.values().sum::<f32>() / c.proficiencies.len() as f32
                    }
                } else {
                    let sum: f32 = required
                        .iter()
                        .map(|(skill, _)| {
                            c.proficiencies.get(&skill.to_lowercase()).copied().unwrap_or(0.0)
                        })
                        .sum();
                    sum / required.len() as f32
                };
                let load_term = 1.0 - c.current_load;
                let distance_term = match task_pos {
                    Some(pos) => {
                        let distance = c.current_position.distance_to(&pos);
                        (1.0 - (distance / BEST_AGENT_MAX_RANGE)).max(0.0) as f32
                    }
                    None => 0.0,
                };
                let score = w_skill * skill_term + w_load * load_term + w_distance * distance_term;
                (score, c)
            })
            .min_by(|(score_a, a), (score_b, b)| {
                score_b
                    .total_cmp(score_a)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .map(|(_, c)| c)
    }

    /// Removes every inactive agent. Returns the count removed.
    pub fn cleanup_inactive(&self) -> usize {
        let inactive: Vec<AgentId> = self
            .by_id
            .iter()
            .filter(|entry| !entry.value().snapshot().active)
            .map(|entry| *entry.key())
            .collect();
        for id in &inactive {
            self.unregister(*id);
        }
        inactive.len()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(n: u128, name: &str) -> (AgentId, Arc<Capability>) {
        let id = AgentId::new(n);
        (id, Arc::new(Capability::new(id, name)))
    }

    #[test]
    fn register_then_lookup_by_id_and_name_agree() {
        let registry = CapabilityRegistry::new();
        let (id, cap) = agent(1, "Miner");
        registry.register(id, cap).unwrap();

        assert!(registry.get(id).is_some());
        let by_name = registry.get_by_name("MINER").unwrap();
        assert_eq!(by_name.agent_id(), id);
    }

    #[test]
    fn re_registering_a_live_id_fails() {
        let registry = CapabilityRegistry::new();
        let (id, cap) = agent(1, "Miner");
        registry.register(id, cap.clone()).unwrap();
        let err = registry.register(id, cap).unwrap_err();
        assert!(matches!(err, CoreError::Duplicate(_)));
    }

    #[test]
    fn unregister_clears_both_indices() {
        let registry = CapabilityRegistry::new();
        let (id, cap) = agent(1, "Miner");
        registry.register(id, cap).unwrap();
        assert!(registry.unregister(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.get_by_name("miner").is_none());
    }

    #[test]
    fn nearby_query_includes_exact_radius_boundary() {
        let registry = CapabilityRegistry::new();
        let (id, cap) = agent(1, "Miner");
        cap.update_position(Vec3i::new(10, 0, 0));
        registry.register(id, cap).unwrap();

        let nearby = registry.get_nearby_agents(Vec3i::new(0, 0, 0), 10.0);
        assert_eq!(nearby.len(), 1);

        let none = registry.get_nearby_agents(Vec3i::new(0, 0, 0), 9.99);
        assert!(none.is_empty());
    }

    #[test]
    fn best_agent_prefers_closer_lower_load_over_far_specialist() {
        let registry = CapabilityRegistry::new();

        let (specialist_id, specialist) = agent(1, "Specialist");
        specialist.set_proficiency("mining", 0.9).unwrap();
        specialist.update_load(0.2);
        specialist.update_position(Vec3i::new(100, 64, 100));
        registry.register(specialist_id, specialist).unwrap();

        let (generalist_id, generalist) = agent(2, "Generalist");
        generalist.set_proficiency("mining", 0.7).unwrap();
        generalist.update_load(0.5);
        generalist.update_position(Vec3i::new(10, 64, 10));
        registry.register(generalist_id, generalist).unwrap();

        let (novice_id, novice) = agent(3, "Novice");
        novice.set_proficiency("mining", 0.6).unwrap();
        novice.update_load(0.1);
        novice.update_position(Vec3i::new(5, 64, 5));
        registry.register(novice_id, novice).unwrap();

        let mut required = HashMap::new();
        required.insert("mining".to_string(), 0.5);

        let best = registry
            .find_best_agent(&required, Some(Vec3i::new(0, 64, 0)))
            .expect("a best agent");

        assert_ne!(best.agent_id, specialist_id);
        assert!(best.agent_id == generalist_id || best.agent_id == novice_id);
    }

    #[test]
    fn cleanup_inactive_removes_deactivated_agents_only() {
        let registry = CapabilityRegistry::new();
        let (active_id, active_cap) = agent(1, "Active");
        registry.register(active_id, active_cap).unwrap();

        let (inactive_id, inactive_cap) = agent(2, "Inactive");
        inactive_cap.set_active(false);
        registry.register(inactive_id, inactive_cap).unwrap();

        assert_eq!(registry.cleanup_inactive(), 1);
        assert!(registry.get(active_id).is_some());
        assert!(registry.get(inactive_id).is_none());
    }
}
