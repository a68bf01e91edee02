//! 计划校验器
//!
//! 三道门：依赖子图无环、每个能力需求可在注册表目录中解析、
//! 计划去重后的能力需求总数不超过预算。任一失败返回结构化错误，
//! 供重规划时反馈给提案接口。

use crate::capability::CapabilityRegistry;
use crate::core::OrchestratorError;
use crate::plan::graph::PlanGraph;
use crate::plan::types::Plan;

/// 校验计划；通过时返回一个合法拓扑序
pub fn validate(plan: &Plan, registry: &CapabilityRegistry) -> Result<Vec<String>, OrchestratorError> {
    let graph = PlanGraph::new(&plan.subtasks);
    let order = graph
        .topological_sort()
        .map_err(OrchestratorError::CyclicDependency)?;

    // 按拓扑序报错，失败信息稳定可复现
    for id in &order {
        let task = match plan.get(id) {
            Some(t) => t,
            None => continue,
        };
        for capability in &task.requires {
            if registry.resolve_tag(capability).is_none() {
                return Err(OrchestratorError::UnresolvedCapability {
                    subtask: id.clone(),
                    capability: capability.clone(),
                });
            }
        }
    }

    let requested = plan.distinct_requirements().len();
    if requested > registry.budget() {
        return Err(OrchestratorError::CapabilityBudgetExceeded {
            requested,
            budget: registry.budget(),
        });
    }

    Ok(order)
}
