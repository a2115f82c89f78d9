//! Engine entry point
//!
//! The engine ties a backend registry to the settings used when graphs are
//! finalized into executable plans.

use crate::backend::BackendRegistry;
use crate::config::EngineConfig;
use crate::exec::{check_kernels, ExecOptions, ExecutablePlan, Inputs, Outputs, PlanSettings};
use crate::graph::{Graph, GraphBuilder};
use crate::plan::{BackendPlan, PlanOptions};
use crate::sched::{PlacementPolicy, TieBreak};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What finalizing a graph would produce, without running it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReport {
    pub nodes: usize,
    pub transfers: usize,
    pub splits: usize,
    pub inplace_reuses: usize,
    pub backends: Vec<BackendPlan>,
}

impl PlanReport {
    fn of(plan: &ExecutablePlan) -> Self {
        Self {
            nodes: plan.scheduled().graph().num_nodes(),
            transfers: plan.scheduled().num_transfers(),
            splits: plan.scheduled().splits().len(),
            inplace_reuses: plan.memory().inplace_reuses(),
            backends: plan.memory().backends().map(|(_, p)| p.clone()).collect(),
        }
    }

    /// Report entry for a backend by name
    pub fn backend(&self, name: &str) -> Option<&BackendPlan> {
        self.backends.iter().find(|b| b.backend == name)
    }
}

pub struct Engine {
    registry: Arc<BackendRegistry>,
    settings: PlanSettings,
}

impl Engine {
    /// Engine over `registry` with default placement and planning
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            settings: PlanSettings::default(),
        }
    }

    /// Create the configured backends and planning settings
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = BackendRegistry::from_configs(&config.cpu, &config.streams)?;
        info!(backends = registry.len(), "engine ready");
        Ok(Self {
            registry: Arc::new(registry),
            settings: PlanSettings {
                policy: config.placement.clone(),
                tie_break: config.tie_break,
                options: config.plan_options(),
            },
        })
    }

    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.settings.policy = policy;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.settings.tie_break = tie_break;
        self
    }

    pub fn with_plan_options(mut self, options: PlanOptions) -> Self {
        self.settings.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.settings.policy
    }

    pub fn begin_graph(&self) -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Schedule and plan `graph`.
    ///
    /// Plans finalized from the same graph share its weight buffers and may
    /// run concurrently; each owns its own arenas.
    pub fn finalize(&self, graph: &Graph) -> Result<ExecutablePlan> {
        ExecutablePlan::new(Arc::clone(&self.registry), graph, self.settings.clone())
    }

    /// Validate, schedule and plan without allocating arenas or dispatching
    pub fn dry_run(&self, graph: &Graph) -> Result<PlanReport> {
        let plan = self.finalize(graph)?;
        check_kernels(&self.registry, plan.scheduled())?;
        Ok(PlanReport::of(&plan))
    }

    pub fn execute(&self, plan: &mut ExecutablePlan, inputs: &Inputs, options: &ExecOptions) -> Result<Outputs> {
        plan.execute(inputs, options)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("policy", &self.settings.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuConfig;
    use crate::tensor::{DType, HostTensor};

    fn engine() -> Engine {
        Engine::new(BackendRegistry::cpu(CpuConfig::default()).unwrap())
    }

    #[test]
    fn test_dry_run_reports_arenas() {
        let engine = engine();
        let mut b = engine.begin_graph();
        let x = b.input("x", DType::F32, &[8]).unwrap();
        let y = b.silu(x).unwrap();
        b.mark_output(y).unwrap();
        let graph = b.build().unwrap();

        let report = engine.dry_run(&graph).unwrap();
        assert_eq!(report.nodes, 1);
        assert_eq!(report.transfers, 0);
        let cpu = report.backend("cpu").unwrap();
        assert_eq!(cpu.arena_size, 64);
        assert_eq!(cpu.planned_tensors, 2);
    }

    #[test]
    fn test_execute_simple_graph() {
        let engine = engine();
        let mut b = engine.begin_graph();
        let x = b.input("x", DType::F32, &[4]).unwrap();
        let y = b.scale(x, 0.5).unwrap();
        let z = b.add(y, x).unwrap();
        b.set_name(z, "z").unwrap();
        b.mark_output(z).unwrap();
        let graph = b.build().unwrap();

        let mut plan = engine.finalize(&graph).unwrap();
        plan.validate().unwrap();
        let inputs = Inputs::new().with("x", HostTensor::from_f32(&[2.0, 4.0, -2.0, 0.0], vec![4]).unwrap());
        let outputs = engine.execute(&mut plan, &inputs, &ExecOptions::default()).unwrap();
        assert_eq!(outputs.get("z").unwrap().to_f32_vec().unwrap(), vec![3.0, 6.0, -3.0, 0.0]);
        assert!(plan.arena_bytes() > 0);
    }

    #[test]
    fn test_missing_and_mismatched_inputs() {
        let engine = engine();
        let mut b = engine.begin_graph();
        let x = b.input("x", DType::F32, &[4]).unwrap();
        let y = b.relu(x).unwrap();
        b.mark_output(y).unwrap();
        let graph = b.build().unwrap();
        let mut plan = engine.finalize(&graph).unwrap();

        let err = plan.execute(&Inputs::new(), &ExecOptions::default()).unwrap_err();
        assert!(matches!(err, crate::Error::MissingInput(name) if name == "x"));

        let wrong = Inputs::new().with("x", HostTensor::from_f32(&[1.0; 2], vec![2]).unwrap());
        let err = plan.execute(&wrong, &ExecOptions::default()).unwrap_err();
        assert!(matches!(err, crate::Error::InputMismatch { .. }));
    }
}
