//! Execution plan: a DAG of on-chain steps.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::EngineError;

use super::transaction::TxSpec;

/// One step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PlanStep {
    /// Unique within the plan.
    pub id: String,
    /// Position in the authored order.
    pub index: i32,
    pub chain_id: i64,
    pub from_address: String,
    pub to_address: String,
    #[builder(default = "0".to_string())]
    pub value: String,
    /// Pre-encoded call data.
    #[builder(default, setter(strip_option))]
    pub data: Option<String>,
    /// Human-readable call descriptor, carried for audit and display.
    #[builder(default, setter(strip_option))]
    pub function: Option<String>,
    #[builder(default, setter(strip_option))]
    pub params: Option<serde_json::Value>,
    /// Step ids that must confirm before this one may run.
    #[builder(default)]
    pub depends_on: Vec<String>,
    /// Whether this step may run alongside other eligible steps.
    #[builder(default = false)]
    pub parallelizable: bool,
    #[builder(default = 0.0)]
    pub risk_score: f64,
    #[builder(default = false)]
    pub simulate: bool,
}

impl PlanStep {
    /// Submission spec for this step, bound to its plan and requester.
    pub fn to_tx_spec(
        &self,
        plan_id: Uuid,
        user_id: Option<String>,
        agent_id: Option<String>,
    ) -> TxSpec {
        TxSpec {
            chain_id: self.chain_id,
            from_address: self.from_address.clone(),
            to_address: self.to_address.clone(),
            value: self.value.clone(),
            data: self.data.clone(),
            gas_limit: None,
            max_fee_per_gas: None,
            priority_fee_per_gas: None,
            nonce: None,
            user_id,
            agent_id,
            plan_id: Some(plan_id),
            step_id: Some(self.id.clone()),
            risk_score: self.risk_score,
            simulate: self.simulate,
        }
    }
}

/// An ordered execution of steps.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Plan {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub steps: Vec<PlanStep>,
    #[builder(default = false)]
    pub cross_chain: bool,
    #[builder(default, setter(strip_option))]
    pub estimated_gas: Option<String>,
    #[builder(default, setter(strip_option))]
    pub estimated_time_secs: Option<i64>,
}

impl Plan {
    /// Validate the dependency graph: non-empty, unique step ids, known
    /// dependencies, and no cycles (Kahn's algorithm).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::Validation("plan has no steps".into()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(EngineError::Validation(format!(
                        "step {} depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }

        // Kahn's algorithm; leftover nodes mean a cycle.
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(next) = dependents.get(id) {
                for dependent in next {
                    let degree = in_degree
                        .get_mut(dependent)
                        .ok_or_else(|| EngineError::Validation("inconsistent graph".into()))?;
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(EngineError::Validation(
                "plan dependency graph has a cycle".into(),
            ));
        }
        Ok(())
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps whose dependencies are all in `confirmed`, excluding any in
    /// `started`.
    pub fn eligible_steps<'a>(
        &'a self,
        confirmed: &HashSet<String>,
        started: &HashSet<String>,
    ) -> Vec<&'a PlanStep> {
        self.steps
            .iter()
            .filter(|s| !started.contains(&s.id) && !confirmed.contains(&s.id))
            .filter(|s| s.depends_on.iter().all(|d| confirmed.contains(d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::builder()
            .id(id)
            .index(0i32)
            .chain_id(1i64)
            .from_address("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
            .to_address("0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB")
            .depends_on(deps.iter().map(|d| d.to_string()).collect::<Vec<_>>())
            .build()
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan::builder().steps(steps).build()
    }

    #[test]
    fn empty_plan_is_invalid() {
        assert!(plan(vec![]).validate().is_err());
    }

    #[test]
    fn linear_chain_is_valid() {
        let p = plan(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let p = plan(vec![step("a", &[]), step("a", &[])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let p = plan(vec![step("a", &["ghost"])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        let p = plan(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let p = plan(vec![step("a", &["a"])]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn eligibility_follows_confirmations() {
        let p = plan(vec![
            step("a", &[]),
            step("b", &[]),
            step("c", &["a", "b"]),
        ]);

        let mut confirmed = HashSet::new();
        let started = HashSet::new();

        let first: Vec<_> = p
            .eligible_steps(&confirmed, &started)
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(first, vec!["a", "b"]);

        confirmed.insert("a".to_string());
        let second: Vec<_> = p
            .eligible_steps(&confirmed, &started)
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(second, vec!["b"], "c still blocked on b");

        confirmed.insert("b".to_string());
        let third: Vec<_> = p
            .eligible_steps(&confirmed, &started)
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(third, vec!["c"]);
    }

    #[test]
    fn step_spec_carries_plan_linkage() {
        let p = plan(vec![step("a", &[])]);
        let spec = p.steps[0].to_tx_spec(p.id, Some("u1".into()), None);
        assert_eq!(spec.plan_id, Some(p.id));
        assert_eq!(spec.step_id.as_deref(), Some("a"));
        assert_eq!(spec.user_id.as_deref(), Some("u1"));
    }
}
