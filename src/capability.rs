//! Agent capability registry.
//!
//! The [`CapabilityStore`] owns every [`Agent`] record. Records change only
//! through [`CapabilityStore::register`] and [`CapabilityStore::record_outcome`];
//! both write through to the [`RecordStore`] before the in-memory copy is
//! replaced, so a storage failure leaves the previous record intact.

use crate::events::{EventBus, OrchestratorEvent};
use crate::persistence::RecordStore;
use crate::types::{
    clamp_unit, lock, read, write, AgentName, CognitivePattern, OrchestratorError, Result,
};
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Capability category keys. The common ones are named; any other lowercase
/// identifier (`mini_notation`, `waveforms`, ...) is kept as [`SkillCategory::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkillCategory {
    Expertise,
    Roles,
    Techniques,
    Functions,
    Patterns,
    Tools,
    Languages,
    Sources,
    Knowledge,
    Coordination,
    Analysis,
    Integration,
    /// Must match `[a-z][a-z0-9_]*`; build it through `parse`.
    Other(String),
}

impl SkillCategory {
    pub fn as_str(&self) -> &str {
        match self {
            SkillCategory::Expertise => "expertise",
            SkillCategory::Roles => "roles",
            SkillCategory::Techniques => "techniques",
            SkillCategory::Functions => "functions",
            SkillCategory::Patterns => "patterns",
            SkillCategory::Tools => "tools",
            SkillCategory::Languages => "languages",
            SkillCategory::Sources => "sources",
            SkillCategory::Knowledge => "knowledge",
            SkillCategory::Coordination => "coordination",
            SkillCategory::Analysis => "analysis",
            SkillCategory::Integration => "integration",
            SkillCategory::Other(key) => key.as_str(),
        }
    }
}

fn is_category_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl fmt::Display for SkillCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SkillCategory {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_lowercase();
        let category = match key.as_str() {
            "expertise" => SkillCategory::Expertise,
            "roles" => SkillCategory::Roles,
            "techniques" => SkillCategory::Techniques,
            "functions" => SkillCategory::Functions,
            "patterns" => SkillCategory::Patterns,
            "tools" => SkillCategory::Tools,
            "languages" => SkillCategory::Languages,
            "sources" => SkillCategory::Sources,
            "knowledge" => SkillCategory::Knowledge,
            "coordination" => SkillCategory::Coordination,
            "analysis" => SkillCategory::Analysis,
            "integration" => SkillCategory::Integration,
            _ if is_category_key(&key) => SkillCategory::Other(key),
            _ => {
                return Err(OrchestratorError::InvalidCapability(format!(
                    "invalid capability category '{}'",
                    s
                )))
            }
        };
        Ok(category)
    }
}

impl Serialize for SkillCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SkillCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        key.parse().map_err(de::Error::custom)
    }
}

/// Typed capability descriptor: category -> skill tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct CapabilityDescriptor(BTreeMap<SkillCategory, BTreeSet<String>>);

impl CapabilityDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add skills under a category (builder style).
    pub fn with<I, S>(mut self, category: SkillCategory, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .entry(category)
            .or_default()
            .extend(skills.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = (&SkillCategory, &BTreeSet<String>)> {
        self.0.iter()
    }

    /// Every skill tag across all categories.
    pub fn skills(&self) -> impl Iterator<Item = &str> {
        self.0.values().flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        self.0.values().any(|set| set.contains(skill))
    }

    pub fn intersects(&self, required: &[String]) -> bool {
        required.iter().any(|skill| self.has_skill(skill))
    }

    /// Reject empty descriptors, empty categories and blank tags.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(OrchestratorError::InvalidCapability(
                "descriptor has no categories".to_string(),
            ));
        }
        for (category, skills) in &self.0 {
            if skills.is_empty() {
                return Err(OrchestratorError::InvalidCapability(format!(
                    "category '{}' lists no skills",
                    category
                )));
            }
            if skills.iter().any(|skill| skill.trim().is_empty()) {
                return Err(OrchestratorError::InvalidCapability(format!(
                    "category '{}' contains a blank skill tag",
                    category
                )));
            }
        }
        Ok(())
    }
}

/// A registered agent and its performance history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub name: AgentName,

    #[serde(rename = "type")]
    pub agent_type: String,

    pub capabilities: CapabilityDescriptor,

    /// Moving-average outcome score in [0, 1]
    pub performance_score: f64,

    /// Moving-average success rate in [0, 1]
    pub success_rate: f64,

    pub preferred_pattern: CognitivePattern,

    pub enhancement_score: f64,

    pub simd_enabled: bool,

    pub last_active: DateTime<Utc>,

    /// Cumulative; survives re-registration
    pub total_tasks: u64,

    #[serde(default)]
    pub description: Option<String>,
}

impl Agent {
    /// Create an agent with the registry's default scores.
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: CapabilityDescriptor,
        preferred_pattern: CognitivePattern,
    ) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities,
            performance_score: 0.85,
            success_rate: 0.89,
            preferred_pattern,
            enhancement_score: 1.0,
            simd_enabled: false,
            last_active: Utc::now(),
            total_tasks: 0,
            description: None,
        }
    }

    pub fn with_scores(mut self, performance_score: f64, success_rate: f64) -> Self {
        self.performance_score = performance_score;
        self.success_rate = success_rate;
        self
    }

    pub fn with_enhancement(mut self, enhancement_score: f64, simd_enabled: bool) -> Self {
        self.enhancement_score = enhancement_score;
        self.simd_enabled = simd_enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this agent can be staffed into `role`.
    pub fn fills_role(&self, role: &str) -> bool {
        self.agent_type == role || self.capabilities.has_skill(role)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidCapability(
                "agent name must not be empty".to_string(),
            ));
        }
        self.capabilities.validate()
    }
}

/// Ranking used by every query: performance desc, success rate desc, name asc.
pub fn rank_agents(a: &Agent, b: &Agent) -> Ordering {
    b.performance_score
        .total_cmp(&a.performance_score)
        .then_with(|| b.success_rate.total_cmp(&a.success_rate))
        .then_with(|| a.name.cmp(&b.name))
}

/// On-disk agent definition file.
///
/// Accepts both the flat layout (`performance_score` at the top level) and the
/// nested `performance_metrics` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub agent_type: String,

    pub capabilities: BTreeMap<String, Vec<String>>,

    #[serde(alias = "ruv_pattern_preference")]
    pub preferred_pattern: String,

    #[serde(default)]
    pub performance_score: Option<f64>,

    #[serde(default)]
    pub performance_metrics: Option<DefinitionMetrics>,

    #[serde(default, alias = "cognitive_enhancement_score")]
    pub enhancement_score: Option<f64>,

    #[serde(default, alias = "simd_optimization_enabled")]
    pub simd_enabled: Option<bool>,

    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionMetrics {
    #[serde(default)]
    pub efficiency: Option<f64>,
    #[serde(default)]
    pub success_rate: Option<f64>,
}

impl TryFrom<AgentDefinition> for Agent {
    type Error = OrchestratorError;

    fn try_from(def: AgentDefinition) -> Result<Self> {
        let mut descriptor = CapabilityDescriptor::new();
        for (category, skills) in def.capabilities {
            descriptor = descriptor.with(category.parse()?, skills);
        }
        let pattern: CognitivePattern = def.preferred_pattern.parse()?;
        let metrics = def.performance_metrics.as_ref();

        let mut agent = Agent::new(def.name, def.agent_type, descriptor, pattern);
        if let Some(score) = def
            .performance_score
            .or_else(|| metrics.and_then(|m| m.efficiency))
        {
            agent.performance_score = score;
        }
        if let Some(rate) = metrics.and_then(|m| m.success_rate) {
            agent.success_rate = rate;
        }
        if let Some(enhancement) = def.enhancement_score {
            agent.enhancement_score = enhancement;
        }
        if let Some(simd) = def.simd_enabled {
            agent.simd_enabled = simd;
        }
        agent.description = def.description;
        Ok(agent)
    }
}

/// Durable registry of agents, safe to share across tasks.
pub struct CapabilityStore {
    agents: RwLock<HashMap<AgentName, Arc<Mutex<Agent>>>>,
    backend: Arc<dyn RecordStore>,
    events: EventBus,
    decay: f64,
}

impl fmt::Debug for CapabilityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityStore")
            .field("agents", &read(&self.agents).len())
            .field("decay", &self.decay)
            .finish_non_exhaustive()
    }
}

impl CapabilityStore {
    /// Open the store, loading every agent already persisted in `backend`.
    pub fn open(backend: Arc<dyn RecordStore>, events: EventBus, decay: f64) -> Result<Self> {
        let agents = backend
            .load_agents()?
            .into_iter()
            .map(|agent| (agent.name.clone(), Arc::new(Mutex::new(agent))))
            .collect::<HashMap<_, _>>();
        debug!("Loaded {} agents from storage", agents.len());
        Ok(Self {
            agents: RwLock::new(agents),
            backend,
            events,
            decay: decay.clamp(f64::EPSILON, 1.0),
        })
    }

    /// Insert or replace an agent by name, returning the previous record.
    ///
    /// Scores, pattern and capabilities come from `agent`; `total_tasks` is
    /// carried over from the existing record.
    pub fn register(&self, agent: Agent) -> Result<Option<Agent>> {
        agent.validate()?;
        let mut agent = agent;
        agent.performance_score = clamp_unit(agent.performance_score);
        agent.success_rate = clamp_unit(agent.success_rate);
        agent.last_active = Utc::now();

        let mut agents = write(&self.agents);
        let prior = match agents.get(&agent.name) {
            Some(slot) => {
                let mut current = lock(slot);
                agent.total_tasks = current.total_tasks;
                self.backend.upsert_agent(&agent)?;
                Some(std::mem::replace(&mut *current, agent.clone()))
            }
            None => {
                self.backend.upsert_agent(&agent)?;
                agents.insert(agent.name.clone(), Arc::new(Mutex::new(agent.clone())));
                None
            }
        };
        drop(agents);

        info!(
            "Registered agent '{}' ({}){}",
            agent.name,
            agent.agent_type,
            if prior.is_some() { ", replacing prior record" } else { "" }
        );
        self.events.emit(OrchestratorEvent::AgentRegistered {
            name: agent.name,
            replaced: prior.is_some(),
        });
        Ok(prior)
    }

    pub fn lookup(&self, name: &str) -> Result<Agent> {
        let slot = self.slot(name)?;
        let agent = lock(&slot).clone();
        Ok(agent)
    }

    /// Agents preferring `pattern` or holding any of `required_skills`,
    /// ranked by [`rank_agents`].
    pub fn query_by_pattern(
        &self,
        pattern: CognitivePattern,
        required_skills: &[String],
    ) -> Vec<Agent> {
        let mut matches: Vec<Agent> = self
            .snapshot()
            .into_iter()
            .filter(|agent| {
                agent.preferred_pattern == pattern
                    || agent.capabilities.intersects(required_skills)
            })
            .collect();
        matches.sort_by(rank_agents);
        matches
    }

    /// Agent to staff into `role` for a task run under `pattern`.
    ///
    /// Takes the first [`query_by_pattern`](Self::query_by_pattern) match that
    /// fills the role. When no match does, falls back to the best-ranked agent
    /// whose type is `role`.
    pub fn staff_role(&self, role: &str, pattern: CognitivePattern) -> Option<Agent> {
        let required = [role.to_string()];
        self.query_by_pattern(pattern, &required)
            .into_iter()
            .find(|agent| agent.fills_role(role))
            .or_else(|| {
                self.snapshot()
                    .into_iter()
                    .filter(|agent| agent.fills_role(role))
                    .min_by(rank_agents)
            })
    }

    /// Fold one task outcome into the agent's moving averages.
    pub fn record_outcome(
        &self,
        name: &str,
        succeeded: bool,
        duration_hint: Option<Duration>,
    ) -> Result<Agent> {
        let slot = self.slot(name)?;
        let mut current = lock(&slot);

        let outcome = if succeeded { 1.0 } else { 0.0 };
        let mut updated = current.clone();
        updated.performance_score =
            clamp_unit(self.decay * outcome + (1.0 - self.decay) * current.performance_score);
        updated.success_rate =
            clamp_unit(self.decay * outcome + (1.0 - self.decay) * current.success_rate);
        updated.total_tasks += 1;
        updated.last_active = Utc::now();

        self.backend.upsert_agent(&updated)?;
        *current = updated.clone();
        drop(current);

        debug!(
            agent = %name,
            succeeded,
            duration_ms = duration_hint.map(|d| d.as_millis() as u64),
            performance_score = updated.performance_score,
            "Recorded agent outcome"
        );
        self.events.emit(OrchestratorEvent::AgentOutcomeRecorded {
            name: updated.name.clone(),
            succeeded,
            performance_score: updated.performance_score,
        });
        Ok(updated)
    }

    /// All agents ordered by name.
    pub fn list(&self) -> Vec<Agent> {
        let mut agents = self.snapshot();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn len(&self) -> usize {
        read(&self.agents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every `*.json` agent definition found under `dir`.
    pub fn load_definitions(&self, dir: &Path) -> Result<Vec<AgentName>> {
        let mut registered = Vec::new();
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = entry.map_err(|e| {
                OrchestratorError::Storage(format!("failed to walk {}: {}", dir.display(), e))
            })?;
            let is_json = entry.path().extension().is_some_and(|ext| ext == "json");
            if entry.file_type().is_file() && is_json {
                paths.push(entry.into_path());
            }
        }
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                OrchestratorError::Storage(format!("failed to read {}: {}", path.display(), e))
            })?;
            let definition: AgentDefinition = serde_json::from_str(&content).map_err(|e| {
                OrchestratorError::InvalidCapability(format!("{}: {}", path.display(), e))
            })?;
            let agent = Agent::try_from(definition)?;
            let name = agent.name.clone();
            self.register(agent)?;
            registered.push(name);
        }

        info!(
            "Registered {} agent definitions from {}",
            registered.len(),
            dir.display()
        );
        Ok(registered)
    }

    fn slot(&self, name: &str) -> Result<Arc<Mutex<Agent>>> {
        read(&self.agents)
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent '{}'", name)))
    }

    fn snapshot(&self) -> Vec<Agent> {
        let slots: Vec<_> = read(&self.agents).values().cloned().collect();
        slots.iter().map(|slot| lock(slot).clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Persistence;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn descriptor(skills: &[&str]) -> CapabilityDescriptor {
        CapabilityDescriptor::new().with(SkillCategory::Expertise, skills.iter().copied())
    }

    fn store() -> CapabilityStore {
        let backend = Arc::new(Persistence::in_memory().unwrap());
        CapabilityStore::open(backend, EventBus::default(), 0.2).unwrap()
    }

    #[test]
    fn test_register_rejects_empty_descriptor() {
        let store = store();
        let agent = Agent::new(
            "ghost",
            "coder",
            CapabilityDescriptor::new(),
            CognitivePattern::Convergent,
        );
        let err = store.register(agent).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidCapability(_)));
        assert!(store.is_empty());

        let blank = Agent::new(
            "blank",
            "coder",
            descriptor(&["  "]),
            CognitivePattern::Convergent,
        );
        assert!(store.register(blank).is_err());
    }

    #[test]
    fn test_reregistration_preserves_total_tasks() {
        let store = store();
        let first = Agent::new(
            "coder",
            "coder",
            descriptor(&["rust"]),
            CognitivePattern::Convergent,
        );
        assert!(store.register(first).unwrap().is_none());

        store.record_outcome("coder", true, None).unwrap();
        store.record_outcome("coder", false, None).unwrap();

        let replacement = Agent::new(
            "coder",
            "engineer",
            descriptor(&["go"]),
            CognitivePattern::Systems,
        )
        .with_scores(0.5, 0.6);
        let prior = store.register(replacement).unwrap().unwrap();
        assert_eq!(prior.agent_type, "coder");
        assert_eq!(prior.total_tasks, 2);

        let current = store.lookup("coder").unwrap();
        assert_eq!(current.total_tasks, 2);
        assert_eq!(current.agent_type, "engineer");
        assert_eq!(current.preferred_pattern, CognitivePattern::Systems);
        assert_eq!(current.performance_score, 0.5);
        assert_eq!(current.success_rate, 0.6);
        assert!(current.capabilities.has_skill("go"));
        assert!(!current.capabilities.has_skill("rust"));
    }

    #[test]
    fn test_register_clamps_scores() {
        let store = store();
        let agent = Agent::new(
            "overachiever",
            "coder",
            descriptor(&["rust"]),
            CognitivePattern::Convergent,
        )
        .with_scores(1.4, -0.3);
        store.register(agent).unwrap();

        let stored = store.lookup("overachiever").unwrap();
        assert_eq!(stored.performance_score, 1.0);
        assert_eq!(stored.success_rate, 0.0);
    }

    #[test]
    fn test_lookup_unknown_agent() {
        let err = store().lookup("nobody").unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn test_record_outcome_moving_average() {
        let store = store();
        let agent = Agent::new(
            "tester",
            "tester",
            descriptor(&["testing"]),
            CognitivePattern::Critical,
        )
        .with_scores(0.85, 0.85);
        store.register(agent).unwrap();

        let after_success = store.record_outcome("tester", true, None).unwrap();
        assert!((after_success.performance_score - 0.88).abs() < 1e-9);
        assert!((after_success.success_rate - 0.88).abs() < 1e-9);

        let after_failure = store
            .record_outcome("tester", false, Some(Duration::from_millis(40)))
            .unwrap();
        assert!((after_failure.performance_score - 0.704).abs() < 1e-9);
        assert_eq!(after_failure.total_tasks, 2);

        let err = store.record_outcome("missing", true, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn test_query_by_pattern_matches_pattern_or_skill() {
        let store = store();
        store
            .register(Agent::new(
                "architect",
                "architect",
                descriptor(&["design"]),
                CognitivePattern::Systems,
            ))
            .unwrap();
        store
            .register(Agent::new(
                "auditor",
                "reviewer",
                descriptor(&["security"]),
                CognitivePattern::Critical,
            ))
            .unwrap();
        store
            .register(Agent::new(
                "idle",
                "coder",
                descriptor(&["cobol"]),
                CognitivePattern::Lateral,
            ))
            .unwrap();

        let names: Vec<_> = store
            .query_by_pattern(CognitivePattern::Systems, &["security".to_string()])
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["architect", "auditor"]);

        assert!(store
            .query_by_pattern(CognitivePattern::Divergent, &["haskell".to_string()])
            .is_empty());
    }

    #[test]
    fn test_query_order_is_total_for_random_agent_sets() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..25 {
            let store = store();
            let count = rng.gen_range(1..30);
            for i in 0..count {
                // Coarse score buckets force ties on the first two keys
                let perf = rng.gen_range(0..4) as f64 / 4.0;
                let rate = rng.gen_range(0..3) as f64 / 3.0;
                let pattern = CognitivePattern::ALL[rng.gen_range(0..5)];
                let agent = Agent::new(
                    format!("agent-{}-{}", round, rng.gen_range(0..1000) + i * 1000),
                    "worker",
                    descriptor(&["shared"]),
                    pattern,
                )
                .with_scores(perf, rate);
                store.register(agent).unwrap();
            }

            let ranked =
                store.query_by_pattern(CognitivePattern::Convergent, &["shared".to_string()]);
            assert_eq!(ranked.len(), store.len());
            for pair in ranked.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                assert!(
                    a.performance_score > b.performance_score
                        || (a.performance_score == b.performance_score
                            && (a.success_rate > b.success_rate
                                || (a.success_rate == b.success_rate && a.name < b.name))),
                    "out of order: {:?} before {:?}",
                    (a.performance_score, a.success_rate, &a.name),
                    (b.performance_score, b.success_rate, &b.name)
                );
            }
        }
    }

    #[test]
    fn test_staff_role_prefers_best_ranked_holder() {
        let store = store();
        store
            .register(
                Agent::new(
                    "junior-tester",
                    "tester",
                    descriptor(&["unit_tests"]),
                    CognitivePattern::Convergent,
                )
                .with_scores(0.6, 0.7),
            )
            .unwrap();
        store
            .register(
                Agent::new(
                    "senior-tester",
                    "qa",
                    CapabilityDescriptor::new().with(SkillCategory::Roles, ["tester"]),
                    CognitivePattern::Critical,
                )
                .with_scores(0.95, 0.9),
            )
            .unwrap();
        store
            .register(
                Agent::new(
                    "star-coder",
                    "coder",
                    descriptor(&["rust"]),
                    CognitivePattern::Convergent,
                )
                .with_scores(0.99, 0.99),
            )
            .unwrap();

        let staffed = store.staff_role("tester", CognitivePattern::Convergent).unwrap();
        assert_eq!(staffed.name, "senior-tester");
        assert!(store
            .staff_role("ops_specialist", CognitivePattern::Convergent)
            .is_none());
    }

    #[test]
    fn test_concurrent_outcomes_for_same_agent_are_serialized() {
        let store = Arc::new(store());
        store
            .register(Agent::new(
                "busy",
                "coder",
                descriptor(&["rust"]),
                CognitivePattern::Convergent,
            ))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.record_outcome("busy", true, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.lookup("busy").unwrap().total_tasks, 80);
    }

    #[test]
    fn test_load_definitions_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("rhythm.json"),
            r#"{
                "name": "rhythm_architect",
                "type": "specialized",
                "capabilities": {
                    "expertise": ["euclidean_rhythms", "polyrhythms"],
                    "functions": ["slow()", "fast()"]
                },
                "ruv_pattern_preference": "convergent",
                "performance_metrics": {"efficiency": 0.94, "success_rate": 0.91},
                "description": "Builds rhythmic patterns"
            }"#,
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested").join("melody.json"),
            r#"{
                "name": "melody_weaver",
                "type": "specialized",
                "capabilities": {"techniques": ["voice leading"]},
                "preferred_pattern": "divergent",
                "performance_score": 0.92
            }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = store();
        let names = store.load_definitions(dir.path()).unwrap();
        assert_eq!(names, vec!["melody_weaver", "rhythm_architect"]);

        let rhythm = store.lookup("rhythm_architect").unwrap();
        assert_eq!(rhythm.performance_score, 0.94);
        assert_eq!(rhythm.success_rate, 0.91);
        assert!(rhythm.capabilities.has_skill("polyrhythms"));

        let melody = store.lookup("melody_weaver").unwrap();
        assert_eq!(melody.preferred_pattern, CognitivePattern::Divergent);
        assert_eq!(melody.success_rate, 0.89);
    }

    #[test]
    fn test_load_definitions_rejects_malformed_category() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{
                "name": "odd",
                "type": "specialized",
                "capabilities": {"Good Vibes!": ["good"]},
                "preferred_pattern": "lateral"
            }"#,
        )
        .unwrap();

        let store = store();
        let err = store.load_definitions(dir.path()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidCapability(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_category_keys_outside_the_named_set() {
        let key: SkillCategory = "Mini_Notation".parse().unwrap();
        assert_eq!(key, SkillCategory::Other("mini_notation".to_string()));
        assert_eq!(key.to_string(), "mini_notation");
        assert_eq!(" roles ".parse::<SkillCategory>().unwrap(), SkillCategory::Roles);

        for bad in ["", "9lives", "two words", "synth-types"] {
            assert!(
                matches!(
                    bad.parse::<SkillCategory>(),
                    Err(OrchestratorError::InvalidCapability(_))
                ),
                "accepted {:?}",
                bad
            );
        }

        let descriptor = CapabilityDescriptor::new().with(key, ["rests"]);
        let json = serde_json::to_string(&descriptor).unwrap();
        assert_eq!(json, r#"{"mini_notation":["rests"]}"#);
    }

    #[test]
    fn test_load_definitions_accepts_original_agent_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("strudel_rhythm_architect.json"),
            r#"{
                "name": "strudel_rhythm_architect",
                "type": "strudel_specialized",
                "capabilities": {
                    "expertise": ["euclidean_rhythms", "polyrhythms", "time_signatures"],
                    "mini_notation": ["multiplication", "division", "brackets", "rests"],
                    "patterns": ["kick patterns", "hihat rolls", "breakbeats", "african rhythms"],
                    "functions": ["euclidean()", "slow()", "fast()", "rev()", "palindrome()"]
                },
                "ruv_pattern_preference": "convergent",
                "description": "Specializes in creating complex rhythmic patterns using mini-notation",
                "performance_score": 0.94
            }"#,
        )
        .unwrap();

        let store = store();
        let names = store.load_definitions(dir.path()).unwrap();
        assert_eq!(names, vec!["strudel_rhythm_architect"]);

        let agent = store.lookup("strudel_rhythm_architect").unwrap();
        assert_eq!(agent.performance_score, 0.94);
        assert!(agent.capabilities.has_skill("brackets"));
        let categories: Vec<_> = agent
            .capabilities
            .categories()
            .map(|(category, _)| category.to_string())
            .collect();
        assert!(categories.contains(&"mini_notation".to_string()));
        assert_eq!(categories.len(), 4);
    }

    #[test]
    fn test_load_definitions_missing_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let err = store
            .load_definitions(&dir.path().join("absent"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Storage(_)));
    }

    #[test]
    fn test_staff_role_follows_query_order() {
        let store = store();
        // Fills "reviewer" only by type and does not prefer the pattern
        store
            .register(
                Agent::new(
                    "by-type",
                    "reviewer",
                    descriptor(&["lint"]),
                    CognitivePattern::Lateral,
                )
                .with_scores(0.7, 0.7),
            )
            .unwrap();
        store
            .register(
                Agent::new(
                    "a-critic",
                    "qa",
                    descriptor(&["reviewer"]),
                    CognitivePattern::Convergent,
                )
                .with_scores(0.8, 0.8),
            )
            .unwrap();
        store
            .register(
                Agent::new(
                    "b-critic",
                    "reviewer",
                    descriptor(&["reviewer"]),
                    CognitivePattern::Critical,
                )
                .with_scores(0.8, 0.8),
            )
            .unwrap();

        let first_match = store
            .query_by_pattern(CognitivePattern::Critical, &["reviewer".to_string()])
            .into_iter()
            .find(|agent| agent.fills_role("reviewer"))
            .unwrap();
        let staffed = store
            .staff_role("reviewer", CognitivePattern::Critical)
            .unwrap();
        // Ties on both scores fall to the name, not the pattern
        assert_eq!(staffed.name, first_match.name);
        assert_eq!(staffed.name, "a-critic");

        store
            .register(
                Agent::new(
                    "a-critic",
                    "qa",
                    descriptor(&["style"]),
                    CognitivePattern::Convergent,
                )
                .with_scores(0.8, 0.8),
            )
            .unwrap();
        store
            .register(
                Agent::new(
                    "b-critic",
                    "qa",
                    descriptor(&["style"]),
                    CognitivePattern::Convergent,
                )
                .with_scores(0.9, 0.9),
            )
            .unwrap();
        let fallback = store
            .staff_role("reviewer", CognitivePattern::Critical)
            .unwrap();
        assert_eq!(fallback.name, "by-type");
    }
}
