//! Milestone plan files.
//!
//! A plan is a JSON or YAML document with a `goal` and an ordered list of
//! `milestones`. Validation rejects empty or duplicate ids, dependencies on
//! unknown milestones and dependency cycles. List order is kept as the
//! execution order; dependencies only decide whether a milestone may run.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::session::{FsdConfig, Milestone, MilestoneStatus, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

impl Plan {
    /// Load and validate a plan file. `.yaml`/`.yml` parse as YAML,
    /// everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let plan = if yaml {
            Self::from_yaml(&contents)
        } else {
            Self::from_json(&contents)
        }
        .with_context(|| format!("invalid plan {}", path.display()))?;
        Ok(plan)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(contents).context("failed to parse plan JSON")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let plan: Plan = serde_yaml::from_str(contents).context("failed to parse plan YAML")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.goal.trim().is_empty() {
            bail!("plan has no goal");
        }
        if self.milestones.is_empty() {
            bail!("plan has no milestones");
        }

        let mut deps: BTreeMap<&str, &[String]> = BTreeMap::new();
        for m in &self.milestones {
            if m.id.trim().is_empty() {
                bail!("milestone \"{}\" has an empty id", m.title);
            }
            if deps.insert(m.id.as_str(), &m.dependencies).is_some() {
                bail!("duplicate milestone id: {}", m.id);
            }
        }
        for m in &self.milestones {
            for dep in &m.dependencies {
                if dep == &m.id {
                    bail!("milestone {} depends on itself", m.id);
                }
                if !deps.contains_key(dep.as_str()) {
                    bail!("milestone {} depends on unknown milestone {dep}", m.id);
                }
            }
        }

        let mut states: HashMap<&str, VisitState> = HashMap::new();
        let mut path = Vec::new();
        for id in deps.keys().copied() {
            if states.contains_key(id) {
                continue;
            }
            if let Some(cycle) = find_cycle(id, &deps, &mut states, &mut path) {
                bail!("dependency cycle detected: {}", cycle.join(" -> "));
            }
        }
        Ok(())
    }

    /// Start a fresh session for this plan. Every milestone begins pending.
    pub fn into_session(self, config: FsdConfig) -> Session {
        let milestones = self
            .milestones
            .into_iter()
            .map(|mut m| {
                m.status = MilestoneStatus::Pending;
                m
            })
            .collect();
        Session::new(self.goal, milestones, config)
    }
}

fn find_cycle<'a>(
    id: &'a str,
    deps: &BTreeMap<&'a str, &'a [String]>,
    states: &mut HashMap<&'a str, VisitState>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    states.insert(id, VisitState::Visiting);
    path.push(id);

    for dep in deps.get(id).copied().unwrap_or_default() {
        let dep = dep.as_str();
        match states.get(dep).copied() {
            None => {
                if let Some(cycle) = find_cycle(dep, deps, states, path) {
                    return Some(cycle);
                }
            }
            Some(VisitState::Visiting) => {
                let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            Some(VisitState::Visited) => {}
        }
    }

    path.pop();
    states.insert(id, VisitState::Visited);
    None
}
