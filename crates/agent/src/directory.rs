use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_core::{AgentStatus, AgentType, Capability, DirectoryConfig, Error, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::runtime::{cutoff_before, hours, AgentRuntime, AgentSnapshot};

#[derive(Default)]
struct DirectoryState {
    agents: HashMap<String, Arc<AgentRuntime>>,
    /// Registration order within each type.
    by_type: HashMap<AgentType, Vec<String>>,
    /// Capability name to holder ids, registration order.
    by_capability: HashMap<String, Vec<String>>,
    orchestrator: Option<String>,
}

impl DirectoryState {
    fn index_capability(&mut self, agent_id: &str, name: &str) {
        let holders = self.by_capability.entry(name.to_string()).or_default();
        if !holders.iter().any(|id| id == agent_id) {
            holders.push(agent_id.to_string());
        }
    }

    fn unindex_capability(&mut self, agent_id: &str, name: &str) {
        if let Some(holders) = self.by_capability.get_mut(name) {
            holders.retain(|id| id != agent_id);
            if holders.is_empty() {
                self.by_capability.remove(name);
            }
        }
    }

    fn remove(&mut self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        let agent = self.agents.remove(agent_id)?;
        if let Some(bucket) = self.by_type.get_mut(&agent.agent_type()) {
            bucket.retain(|id| id != agent_id);
            if bucket.is_empty() {
                self.by_type.remove(&agent.agent_type());
            }
        }
        for cap in agent.capabilities() {
            self.unindex_capability(agent_id, &cap.name);
        }
        if self.orchestrator.as_deref() == Some(agent_id) {
            self.orchestrator = None;
        }
        agent.detach();
        Some(agent)
    }

    /// True when `agent` is the runtime registered under its id.
    fn holds(&self, agent: &AgentRuntime) -> bool {
        self.agents
            .get(agent.id())
            .map(|a| std::ptr::eq(Arc::as_ptr(a), agent))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub total_agents: usize,
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
    pub offline: Vec<String>,
    pub stale: Vec<String>,
    pub degraded: Vec<String>,
    pub orchestrator_available: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy.is_empty()
            && self.offline.is_empty()
            && self.stale.is_empty()
            && self.degraded.is_empty()
            && self.orchestrator_available
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStats {
    pub total_agents: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub capabilities: BTreeMap<String, usize>,
    pub orchestrator_present: bool,
    pub active_agents: usize,
    pub average_idle_secs: f64,
}

/// Registry of live agents with a capability index.
///
/// One coarse lock guards the id map, type buckets, capability index and
/// orchestrator reference together. Agent state locks are only ever taken
/// while holding it, never the other way round.
pub struct AgentDirectory {
    state: RwLock<DirectoryState>,
    config: DirectoryConfig,
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

impl AgentDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            config,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers an agent. Fails without touching state if the id is taken.
    pub fn try_register(self: &Arc<Self>, agent: Arc<AgentRuntime>) -> Result<()> {
        let mut state = self.write();
        let agent_id = agent.id().to_string();
        if state.agents.contains_key(&agent_id) {
            warn!(agent_id = %agent_id, "Duplicate agent registration rejected");
            return Err(Error::DuplicateRegistration(agent_id));
        }

        for cap in agent.capabilities() {
            state.index_capability(&agent_id, &cap.name);
        }
        state.by_type.entry(agent.agent_type()).or_default().push(agent_id.clone());
        if agent.agent_type() == AgentType::Orchestrator {
            if let Some(previous) = state.orchestrator.replace(agent_id.clone()) {
                warn!(previous = %previous, current = %agent_id, "Orchestrator reference replaced");
            }
        }
        agent.attach(Arc::downgrade(self));
        info!(agent_id = %agent_id, agent_type = %agent.agent_type(), "Agent registered");
        state.agents.insert(agent_id, agent);
        Ok(())
    }

    pub fn register(self: &Arc<Self>, agent: Arc<AgentRuntime>) -> bool {
        self.try_register(agent).is_ok()
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        let removed = self.write().remove(agent_id);
        match removed {
            Some(agent) => {
                info!(agent_id = %agent_id, agent_type = %agent.agent_type(), "Agent unregistered");
                true
            }
            None => false,
        }
    }

    /// Unregisters every agent. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.write();
        let ids: Vec<String> = state.agents.keys().cloned().collect();
        for id in &ids {
            state.remove(id);
        }
        info!(count = ids.len(), "Directory cleared");
        ids.len()
    }

    // ----- lookups -----

    pub fn get(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.read().agents.get(agent_id).map(|a| a.snapshot())
    }

    /// Shared runtime for execution. Prefer [`get`](Self::get) for inspection.
    pub fn handle(&self, agent_id: &str) -> Option<Arc<AgentRuntime>> {
        self.read().agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.read().agents.contains_key(agent_id)
    }

    pub fn by_type(&self, agent_type: AgentType) -> Vec<AgentSnapshot> {
        let state = self.read();
        state
            .by_type
            .get(&agent_type)
            .map(|ids| ids.iter().filter_map(|id| state.agents.get(id)).map(|a| a.snapshot()).collect())
            .unwrap_or_default()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<AgentSnapshot> {
        let state = self.read();
        state
            .by_capability
            .get(capability)
            .map(|ids| ids.iter().filter_map(|id| state.agents.get(id)).map(|a| a.snapshot()).collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<AgentSnapshot> {
        let state = self.read();
        let mut all: Vec<AgentSnapshot> = state.agents.values().map(|a| a.snapshot()).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn orchestrator(&self) -> Option<AgentSnapshot> {
        let state = self.read();
        state
            .orchestrator
            .as_ref()
            .and_then(|id| state.agents.get(id))
            .map(|a| a.snapshot())
    }

    // ----- matching -----

    /// Best available agent for a request.
    ///
    /// Candidates must be Idle or Active, not excluded, and hold every required
    /// capability. Preferred-type agents score 2; agents reached only through
    /// the index of a required capability score 1, so an empty requirement
    /// set yields preferred-type agents only. Ties go to Idle over Active,
    /// then the most recently active, then the lowest id.
    pub fn find_best_handle(
        &self,
        required: &[&str],
        preferred_type: Option<AgentType>,
        exclude: &[&str],
    ) -> Option<Arc<AgentRuntime>> {
        let state = self.read();
        let mut scores: HashMap<&str, u8> = HashMap::new();

        if let Some(t) = preferred_type {
            for id in state.by_type.get(&t).into_iter().flatten() {
                scores.insert(id.as_str(), 2);
            }
        }
        for cap in required {
            for id in state.by_capability.get(*cap).into_iter().flatten() {
                scores.entry(id.as_str()).or_insert(1);
            }
        }

        let mut candidates: Vec<(u8, AgentSnapshot, &Arc<AgentRuntime>)> = scores
            .into_iter()
            .filter(|(id, _)| !exclude.contains(id))
            .filter_map(|(id, score)| state.agents.get(id).map(|a| (score, a.snapshot(), a)))
            .filter(|(_, snap, _)| snap.status.is_available())
            .filter(|(_, snap, _)| required.iter().all(|cap| snap.has_capability(cap)))
            .collect();

        candidates.sort_by(|(sa, a, _), (sb, b, _)| {
            sb.cmp(sa)
                .then_with(|| status_rank(a.status).cmp(&status_rank(b.status)))
                .then_with(|| b.last_active_at.cmp(&a.last_active_at))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let best = candidates.first().map(|(_, _, a)| Arc::clone(a));
        debug!(
            required = ?required,
            preferred = ?preferred_type,
            chosen = ?best.as_ref().map(|a| a.id().to_string()),
            "find_best"
        );
        best
    }

    pub fn find_best(
        &self,
        required: &[&str],
        preferred_type: Option<AgentType>,
        exclude: &[&str],
    ) -> Option<AgentSnapshot> {
        self.find_best_handle(required, preferred_type, exclude)
            .map(|a| a.snapshot())
    }

    // ----- capability mutation on behalf of a registered runtime -----

    pub(crate) fn apply_capability_added(&self, agent: &AgentRuntime, capability: Capability) -> bool {
        let mut state = self.write();
        let name = capability.name.clone();
        let added = agent.add_capability_local(capability);
        if state.holds(agent) {
            state.index_capability(agent.id(), &name);
        }
        added
    }

    pub(crate) fn apply_capability_removed(&self, agent: &AgentRuntime, name: &str) -> bool {
        let mut state = self.write();
        let removed = agent.remove_capability_local(name);
        if removed && state.holds(agent) {
            state.unindex_capability(agent.id(), name);
        }
        removed
    }

    // ----- health -----

    pub fn health_check(&self) -> HealthReport {
        let state = self.read();
        let now = Utc::now();
        let stale_cutoff = cutoff_before(Duration::from_secs(self.config.stale_threshold_secs));
        let error_window = Duration::from_secs(self.config.error_window_secs);

        let mut report = HealthReport {
            timestamp: now,
            total_agents: state.agents.len(),
            healthy: Vec::new(),
            unhealthy: Vec::new(),
            offline: Vec::new(),
            stale: Vec::new(),
            degraded: Vec::new(),
            orchestrator_available: false,
        };

        let mut ids: Vec<&String> = state.agents.keys().collect();
        ids.sort();
        for id in ids {
            let agent = &state.agents[id];
            let snap = agent.snapshot();
            match snap.status {
                AgentStatus::Error => report.unhealthy.push(id.clone()),
                AgentStatus::Offline => report.offline.push(id.clone()),
                _ => report.healthy.push(id.clone()),
            }
            if stale_cutoff.map_or(false, |c| snap.last_active_at < c) {
                report.stale.push(id.clone());
            }
            if agent.error_streak(error_window) >= self.config.error_streak_threshold {
                report.degraded.push(id.clone());
            }
        }

        report.orchestrator_available = state
            .orchestrator
            .as_ref()
            .and_then(|id| state.agents.get(id))
            .map(|a| !matches!(a.status(), AgentStatus::Error | AgentStatus::Offline))
            .unwrap_or(false);

        report
    }

    /// Unregisters Idle agents inactive for longer than `max_idle`. The
    /// orchestrator is never evicted. Returns the evicted ids.
    pub fn evict_stale_ids(&self, max_idle: Duration) -> Vec<String> {
        let Some(cutoff) = cutoff_before(max_idle) else {
            return Vec::new();
        };
        let mut state = self.write();
        let stale: Vec<String> = state
            .agents
            .values()
            .filter(|a| state.orchestrator.as_deref() != Some(a.id()))
            .filter(|a| {
                let snap = a.snapshot();
                snap.status == AgentStatus::Idle && snap.last_active_at < cutoff
            })
            .map(|a| a.id().to_string())
            .collect();
        for id in &stale {
            state.remove(id);
            info!(agent_id = %id, "Evicted stale agent");
        }
        stale
    }

    pub fn evict_stale(&self, max_idle_hours: u64) -> usize {
        self.evict_stale_ids(hours(max_idle_hours)).len()
    }

    pub fn stats(&self) -> DirectoryStats {
        let state = self.read();
        let now = Utc::now();
        let snaps: Vec<AgentSnapshot> = state.agents.values().map(|a| a.snapshot()).collect();

        let mut by_type = BTreeMap::new();
        let mut by_status = BTreeMap::new();
        for s in &snaps {
            *by_type.entry(s.agent_type.to_string()).or_insert(0) += 1;
            *by_status.entry(s.status.to_string()).or_insert(0) += 1;
        }
        let capabilities = state
            .by_capability
            .iter()
            .map(|(name, holders)| (name.clone(), holders.len()))
            .collect();
        let active_agents = snaps
            .iter()
            .filter(|s| matches!(s.status, AgentStatus::Active | AgentStatus::Busy))
            .count();
        let average_idle_secs = if snaps.is_empty() {
            0.0
        } else {
            snaps
                .iter()
                .map(|s| (now - s.last_active_at).num_milliseconds().max(0) as f64 / 1000.0)
                .sum::<f64>()
                / snaps.len() as f64
        };

        DirectoryStats {
            total_agents: snaps.len(),
            by_type,
            by_status,
            capabilities,
            orchestrator_present: state.orchestrator.is_some(),
            active_agents,
            average_idle_secs,
        }
    }

    /// Checks that the capability index matches the registered agents' lists.
    pub fn index_is_consistent(&self) -> bool {
        let state = self.read();
        let mut expected: HashMap<String, HashSet<String>> = HashMap::new();
        for (id, agent) in &state.agents {
            for cap in agent.capabilities() {
                expected.entry(cap.name).or_default().insert(id.clone());
            }
        }
        let actual: HashMap<String, HashSet<String>> = state
            .by_capability
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect();
        expected == actual
    }
}

fn status_rank(status: AgentStatus) -> u8 {
    match status {
        AgentStatus::Idle => 0,
        AgentStatus::Active => 1,
        _ => 2,
    }
}
