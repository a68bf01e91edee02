//! 任务分解器
//!
//! 调用提案接口获取候选子任务集合，并转换为 Plan。只做结构检查（缺 id、
//! 自依赖、引用未知 id）；全局无环性留给校验器，因为分解可能基于部分
//! 输出增量进行。

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::OrchestratorError;
use crate::llm::{CapabilitySummary, Proposal, ProposalClient, SubtaskProposal};
use crate::plan::types::{Goal, Plan, Subtask, SubtaskId};

/// 分解器：持有提案客户端，decompose 将目标转为计划
pub struct Decomposer {
    client: Arc<dyn ProposalClient>,
}

impl Decomposer {
    pub fn new(client: Arc<dyn ProposalClient>) -> Self {
        Self { client }
    }

    /// 分解目标为计划。hint 为过往成功计划形状（Procedural 记忆），作为上下文提供
    pub async fn decompose(
        &self,
        goal: &Goal,
        domain_tags: &[String],
        capabilities: &[CapabilitySummary],
        hint: Option<&str>,
    ) -> Result<Plan, OrchestratorError> {
        let mut context = goal.text.clone();
        context.push_str(&format!("\nDomains: {}", domain_tags.join(", ")));
        if let Some(criteria) = &goal.success_criteria {
            context.push_str(&format!("\nSuccess criteria: {}", criteria));
        }
        if let Some(hint) = hint {
            context.push_str(&format!("\nA similar goal previously succeeded with this plan shape:\n{}", hint));
        }

        let subtasks = self.propose_subtasks(&context, capabilities, &BTreeSet::new()).await?;
        Ok(Plan::new(goal.clone(), subtasks))
    }

    /// 为失败/跳过的子任务重新生成子计划；新节点可以依赖 frontier 中已成功的 id
    pub async fn decompose_remainder(
        &self,
        goal: &Goal,
        failed: &[(SubtaskId, String)],
        frontier: &BTreeSet<SubtaskId>,
        capabilities: &[CapabilitySummary],
    ) -> Result<Vec<Subtask>, OrchestratorError> {
        let mut context = goal.text.clone();
        context.push_str("\nThe following subtasks did not complete and must be replanned:");
        for (id, description) in failed {
            context.push_str(&format!("\n- {}: {}", id, description));
        }
        if !frontier.is_empty() {
            let ids: Vec<&str> = frontier.iter().map(String::as_str).collect();
            context.push_str(&format!(
                "\nAlready succeeded (may be used as dependencies): {}",
                ids.join(", ")
            ));
        }

        self.propose_subtasks(&context, capabilities, frontier).await
    }

    async fn propose_subtasks(
        &self,
        context: &str,
        capabilities: &[CapabilitySummary],
        known_external: &BTreeSet<SubtaskId>,
    ) -> Result<Vec<Subtask>, OrchestratorError> {
        let proposal = self
            .client
            .propose(context, capabilities)
            .await
            .map_err(OrchestratorError::Proposal)?;

        let proposals = match proposal {
            Proposal::Subtasks(p) => p,
            Proposal::FinalAnswer(_) | Proposal::CapabilityCall { .. } => {
                return Err(OrchestratorError::Decomposition(
                    "proposal contained no subtasks".to_string(),
                ));
            }
        };

        convert_proposals(proposals, known_external)
    }
}

/// 提案 -> 子任务的结构转换与检查
fn convert_proposals(
    proposals: Vec<SubtaskProposal>,
    known_external: &BTreeSet<SubtaskId>,
) -> Result<Vec<Subtask>, OrchestratorError> {
    if proposals.is_empty() {
        return Err(OrchestratorError::Decomposition(
            "proposal was empty".to_string(),
        ));
    }

    let ids: BTreeSet<String> = proposals.iter().map(|p| p.id.clone()).collect();
    if ids.len() != proposals.len() {
        return Err(OrchestratorError::Decomposition(
            "duplicate subtask id in proposal".to_string(),
        ));
    }

    let mut subtasks = Vec::with_capacity(proposals.len());
    for p in proposals {
        if p.id.trim().is_empty() {
            return Err(OrchestratorError::Decomposition(
                "subtask proposal missing id".to_string(),
            ));
        }
        for dep in &p.depends_on {
            if dep == &p.id {
                return Err(OrchestratorError::Decomposition(format!(
                    "subtask '{}' depends on itself",
                    p.id
                )));
            }
            if !ids.contains(dep) && !known_external.contains(dep) {
                return Err(OrchestratorError::Decomposition(format!(
                    "subtask '{}' depends on unknown id '{}'",
                    p.id, dep
                )));
            }
        }

        let mut task = Subtask::new(p.id, p.description)
            .with_requires(p.requires)
            .with_depends_on(p.depends_on);
        task.criteria = p.criteria;
        task.best_effort = p.best_effort;
        task.delegate = p.delegate;
        subtasks.push(task);
    }

    Ok(subtasks)
}
