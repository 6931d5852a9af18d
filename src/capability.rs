//! An agent's declared skills, tools, position, and load, plus the bid
//! scoring function the Contract-Net manager relies on for ranking.
//!
//! A single mutable-but-thread-safe value type: every mutating method
//! is atomic with respect to observers via an interior `RwLock`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::cnp::TaskAnnouncement;
use crate::error::CoreError;
use crate::identity::{now_epoch_ms, now_monotonic_ms, AgentId};

/// Weight of the skill term in [`Capability::calculate_bid_score`].
const WEIGHT_SKILLS: f32 = 0.5;
/// Weight of the load term.
const WEIGHT_LOAD: f32 = 0.3;
/// Weight of the distance term.
const WEIGHT_DISTANCE: f32 = 0.1;
/// Weight of the tool term.
const WEIGHT_TOOLS: f32 = 0.1;
/// Default max range for the distance term when an announcement has no
/// explicit one.
const DEFAULT_MAX_RANGE: f64 = 128.0;
/// Strict load ceiling below which an active agent counts as available.
const AVAILABILITY_LOAD_CEILING: f32 = 0.8;
/// Default proficiency assigned by `add_skill` when none is given.
const DEFAULT_PROFICIENCY: f32 = 0.5;

/// Integer 3D position. World coordinates in this domain can exceed the
/// `i32` range at extreme distances, so the backing type is `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Vec3i {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Vec3i {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Vec3i) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        let dz = (self.z - other.z) as f64;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

fn normalize_key(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Per-task-type completion bookkeeping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub count: u64,
    pub last_completion_ms: u64,
}

/// A read-only snapshot of a [`Capability`], returned by queries so
/// callers cannot mutate live state through a query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub skills: HashSet<String>,
    pub proficiencies: HashMap<String, f32>,
    pub available_tools: HashSet<String>,
    pub current_position: Vec3i,
    pub current_load: f32,
    pub active: bool,
    pub task_history: HashMap<String, TaskHistoryEntry>,
}

impl CapabilitySnapshot {
    pub fn is_available(&self) -> bool {
        self.active && self.current_load < AVAILABILITY_LOAD_CEILING
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        normalize_key(skill)
            .map(|k| self.skills.contains(&k))
            .unwrap_or(false)
    }
}

struct CapabilityState {
    agent_name: String,
    skills: HashSet<String>,
    proficiencies: HashMap<String, f32>,
    available_tools: HashSet<String>,
    current_position: Vec3i,
    current_load: f32,
    active: bool,
    task_history: HashMap<String, TaskHistoryEntry>,
}

/// An agent's declared capabilities. Mutable through `&self` (interior
/// `RwLock`) so the registry and the owning agent can both hold a
/// cheap handle; every mutating method is atomic with respect to
/// observers.
pub struct Capability {
    agent_id: AgentId,
    state: RwLock<CapabilityState>,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability").field("agent_id", &self.agent_id).finish()
    }
}

/// Equality is by `agent_id` only.
impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        self.agent_id == other.agent_id
    }
}
impl Eq for Capability {}

impl Capability {
    pub fn new(agent_id: AgentId, agent_name: impl Into<String>) -> Self {
        Self {
            agent_id,
            state: RwLock::new(CapabilityState {
                agent_name: agent_name.into(),
                skills: HashSet::new(),
                proficiencies: HashMap::new(),
                available_tools: HashSet::new(),
                current_position: Vec3i::default(),
                current_load: 0.0,
                active: true,
                task_history: HashMap::new(),
            }),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn agent_name(&self) -> String {
        self.state.read().unwrap().agent_name.clone()
    }

    /// Lowercases, rejects null/blank silently, sets proficiency to
    /// [`DEFAULT_PROFICIENCY`] iff the skill wasn't already present.
    pub fn add_skill(&self, skill: &str) {
        let Some(key) = normalize_key(skill) else { return };
        let mut state = self.state.write().unwrap();
        if state.skills.insert(key.clone()) {
            state.proficiencies.entry(key).or_insert(DEFAULT_PROFICIENCY);
        }
    }

    /// Sets proficiency for `skill`, implicitly adding it. Fails with
    /// [`CoreError::InvalidArg`] if `value` is outside `[0, 1]`.
    pub fn set_proficiency(&self, skill: &str, value: f32) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(CoreError::InvalidArg(format!(
                "proficiency {value} out of range [0,1]"
            )));
        }
        let Some(key) = normalize_key(skill) else { return Ok(()) };
        let mut state = self.state.write().unwrap();
        state.skills.insert(key.clone());
        state.proficiencies.insert(key, value);
        Ok(())
    }

    /// Removes the skill (and its proficiency). Returns whether
    /// anything was actually removed.
    pub fn remove_skill(&self, skill: &str) -> bool {
        let Some(key) = normalize_key(skill) else { return false };
        let mut state = self.state.write().unwrap();
        state.proficiencies.remove(&key);
        state.skills.remove(&key)
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        let Some(key) = normalize_key(skill) else { return false };
        self.state.read().unwrap().skills.contains(&key)
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        let Some(key) = normalize_key(tool) else { return false };
        self.state.read().unwrap().available_tools.contains(&key)
    }

    /// `None` is vacuously true: no required tools means the
    /// requirement is trivially satisfied.
    pub fn has_tools(&self, tools: Option<&HashSet<String>>) -> bool {
        match tools {
            None => true,
            Some(required) => {
                let state = self.state.read().unwrap();
                required.iter().all(|t| {
                    normalize_key(t)
                        .map(|k| state.available_tools.contains(&k))
                        .unwrap_or(true)
                })
            }
        }
    }

    pub fn add_tool(&self, tool: &str) {
        if let Some(key) = normalize_key(tool) {
            self.state.write().unwrap().available_tools.insert(key);
        }
    }

    /// Clamps into `[0, 1]`; never fails.
    pub fn update_load(&self, value: f32) {
        self.state.write().unwrap().current_load = value.clamp(0.0, 1.0);
    }

    pub fn update_position(&self, position: Vec3i) {
        self.state.write().unwrap().current_position = position;
    }

    pub fn set_active(&self, active: bool) {
        self.state.write().unwrap().active = active;
    }

    pub fn is_available(&self) -> bool {
        let state = self.state.read().unwrap();
        state.active && state.current_load < AVAILABILITY_LOAD_CEILING
    }

    /// `+inf` if `target` is `None`.
    pub fn distance_to(&self, target: Option<&Vec3i>) -> f64 {
        match target {
            None => f64::INFINITY,
            Some(target) => self.state.read().unwrap().current_position.distance_to(target),
        }
    }

    pub fn record_task_completion(&self, task_type: &str) {
        let Some(key) = normalize_key(task_type) else { return };
        let mut state = self.state.write().unwrap();
        let entry = state.task_history.entry(key).or_insert(TaskHistoryEntry {
            count: 0,
            last_completion_ms: 0,
        });
        entry.count += 1;
        entry.last_completion_ms = now_monotonic_ms();
    }

    pub fn snapshot(&self) -> CapabilitySnapshot {
        let state = self.state.read().unwrap();
        CapabilitySnapshot {
            agent_id: self.agent_id,
            agent_name: state.agent_name.clone(),
            skills: state.skills.clone(),
            proficiencies: state.proficiencies.clone(),
            available_tools: state.available_tools.clone(),
            current_position: state.current_position,
            current_load: state.current_load,
            active: state.active,
            task_history: state.task_history.clone(),
        }
    }

    /// Weighted-sum bid score in `[0, 1]`. Returns `0.0` when inactive.
    ///
    /// - skill term: mean, across required skills, of `p` when
    ///   `p >= min_prof` else a linear sub-threshold penalty
    ///   `p * (p / min_prof)`; if no skills are required, the mean of
    ///   all held proficiencies, or `0.5` if none are held.
    /// - load term: `1 - current_load`.
    /// - distance term: `max(0, 1 - distance / max_range)` if the
    ///   announcement names a location, else `1.0`.
    /// - tool term: fraction of required tools held (`1.0` if none
    ///   required).
    pub fn calculate_bid_score(&self, announcement: &TaskAnnouncement) -> f32 {
        let state = self.state.read().unwrap();
        if !state.active {
            return 0.0;
        }

        let skill_term = if announcement.required_skills.is_empty() {
            if state.proficiencies.is_empty() {
                0.5
            } else {
                state.proficiencies.values().sum::<f32>() / state.proficiencies.len() as f32
            }
        } else {
            let sum: f32 = announcement
                .required_skills
                .iter()
                .map(|(skill, min_prof)| {
                    let p = normalize_key(skill)
                        .and_then(|k| state.proficiencies.get(&k).copied())
                        .unwrap_or(0.0);
                    if p >= *min_prof {
                        p
                    } else if *min_prof > 0.0 {
                        p * (p / min_prof)
                    } else {
                        p
                    }
                })
                .sum();
            sum / announcement.required_skills.len() as f32
        };

        let load_term = 1.0 - state.current_load;

        let distance_term = match &announcement.required_location {
            Some(location) => {
                let distance = state.current_position.distance_to(location);
                (1.0 - (distance / DEFAULT_MAX_RANGE)).max(0.0) as f32
            }
            None => 1.0,
        };

        let tool_term = if announcement.required_tools.is_empty() {
            1.0
        } else {
            let held = announcement
                .required_tools
                .iter()
                .filter(|t| {
                    normalize_key(t)
                        .map(|k| state.available_tools.contains(&k))
                        .unwrap_or(false)
                })
                .count();
            held as f32 / announcement.required_tools.len() as f32
        };

        let score = WEIGHT_SKILLS * skill_term
            + WEIGHT_LOAD * load_term
            + WEIGHT_DISTANCE * distance_term
            + WEIGHT_TOOLS * tool_term;
        score.clamp(0.0, 1.0)
    }

    /// Builds a [`crate::cnp::TaskBid`] for `announcement`, populating
    /// the conventional `capabilities` keys (`proficiencies`, `tools`,
    /// `distance`, `current_load`).
    pub fn create_bid(
        &self,
        announcement: &TaskAnnouncement,
        estimated_time_ms: u64,
        confidence: f32,
    ) -> crate::cnp::TaskBid {
        let score = self.calculate_bid_score(announcement);
        let state = self.state.read().unwrap();
        let distance = match &announcement.required_location {
            Some(location) => state.current_position.distance_to(location),
            None => 0.0,
        };

        let mut capabilities = HashMap::new();
        capabilities.insert(
            "proficiencies".to_string(),
            serde_json::to_value(&state.proficiencies).unwrap_or_default(),
        );
        capabilities.insert(
            "tools".to_string(),
            serde_json::to_value(&state.available_tools).unwrap_or_default(),
        );
        capabilities.insert("distance".to_string(), serde_json::json!(distance));
        capabilities.insert("current_load".to_string(), serde_json::json!(state.current_load));

        crate::cnp::TaskBid {
            announcement_id: announcement.announcement_id.clone(),
            bidder_id: self.agent_id,
            score,
            estimated_time_ms,
            confidence: confidence.clamp(0.0, 1.0),
            capabilities,
        }
    }
}
