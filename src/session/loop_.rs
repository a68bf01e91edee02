//! 会话主循环
//!
//! 分类 - 装载 - 规划 - 执行 - 反思 - 汇总。规划期错误在重规划预算内
//! 重试；执行后若有残余失败且还有迭代预算，保留已成功的子任务、
//! 只对失败部分重新分解。取消与会话超时不向上抛错，折算为 Aborted
//! 报告。恢复路径从最近检查点重建计划，在途状态回退为 Pending。

use std::collections::BTreeSet;

use serde_json::json;
use tracing::{info, warn};

use crate::capability::DomainClassifier;
use crate::core::OrchestratorError;
use crate::memory::MemoryKind;
use crate::plan::{validate, Decomposer, Goal, Plan, SubtaskId, SubtaskStatus};
use crate::scheduler::{Scheduler, TerminalState};
use crate::session::context::SessionContext;
use crate::session::events::SessionEvent;

/// 会话结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// 所有子任务成功
    Complete,
    /// 部分成功
    Partial,
    /// 没有任何子任务成功
    Failed,
    /// 取消或会话超时
    Aborted,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Complete => "complete",
            SessionOutcome::Partial => "partial",
            SessionOutcome::Failed => "failed",
            SessionOutcome::Aborted => "aborted",
        }
    }
}

/// 会话报告
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub summary: String,
    pub failed: Vec<SubtaskId>,
    pub skipped: Vec<SubtaskId>,
    pub iterations: u32,
}

/// 会话主循环
pub struct AgentLoop {
    classifier: DomainClassifier,
    decomposer: Decomposer,
    scheduler: Scheduler,
}

impl AgentLoop {
    pub fn new(classifier: DomainClassifier, decomposer: Decomposer, scheduler: Scheduler) -> Self {
        Self {
            classifier,
            decomposer,
            scheduler,
        }
    }

    /// 从目标文本运行一个新会话
    pub async fn run_session(
        &self,
        goal: Goal,
        ctx: &SessionContext,
    ) -> Result<SessionReport, OrchestratorError> {
        let tags = self.classifier.classify(&goal.text);
        ctx.emit(SessionEvent::Classified { tags: tags.clone() });
        ctx.record_event("classified", json!({ "tags": tags })).await;

        let selected = self.load_domains(&tags, ctx).await?;
        ctx.emit(SessionEvent::CapabilitiesLoaded {
            tags: selected.clone(),
            active: ctx.registry.active_count(),
        });

        let plan = self.plan_goal(&goal, &selected, ctx).await?;
        ctx.emit(SessionEvent::PlanReady {
            version: plan.version,
            subtasks: plan.subtasks.len(),
        });

        self.drive(plan, &selected, ctx).await
    }

    /// 从最近检查点恢复会话；在途状态（Running / Ready）回退为 Pending
    pub async fn resume_session(&self, ctx: &SessionContext) -> Result<SessionReport, OrchestratorError> {
        let checkpoint = ctx
            .checkpoints
            .load_latest(&ctx.session_id)?
            .ok_or_else(|| {
                OrchestratorError::Checkpoint(format!(
                    "no checkpoint for session '{}'",
                    ctx.session_id
                ))
            })?;
        info!(
            session_id = %ctx.session_id,
            sequence = checkpoint.sequence,
            "resuming from checkpoint"
        );
        let mut plan = checkpoint.plan;
        for task in plan.subtasks.values_mut() {
            if matches!(task.status, SubtaskStatus::Running | SubtaskStatus::Ready) {
                task.status = SubtaskStatus::Pending;
            }
        }

        // 领域标签由目标文本确定性重建，不随检查点持久化
        let tags = self.classifier.classify(&plan.goal.text);
        ctx.emit(SessionEvent::Classified { tags: tags.clone() });
        let selected = self.load_domains(&tags, ctx).await?;
        self.ensure_required_loaded(&plan, ctx)?;
        ctx.emit(SessionEvent::CapabilitiesLoaded {
            tags: selected.clone(),
            active: ctx.registry.active_count(),
        });
        ctx.record_event("resumed", json!({ "sequence": checkpoint.sequence })).await;

        self.drive(plan, &selected, ctx).await
    }

    /// 装载分类出的领域包；超预算时从末位（低相关度）开始收缩
    async fn load_domains(
        &self,
        tags: &[String],
        ctx: &SessionContext,
    ) -> Result<Vec<String>, OrchestratorError> {
        let mut selected: Vec<String> = tags.to_vec();
        loop {
            match ctx.registry.load(&selected) {
                Ok(_) => return Ok(selected),
                Err(OrchestratorError::CapabilityBudgetExceeded { requested, budget })
                    if selected.len() > 1 =>
                {
                    let dropped = selected.pop().unwrap_or_default();
                    warn!(
                        dropped = %dropped,
                        requested,
                        budget,
                        "capability budget exceeded, narrowing domain selection"
                    );
                    ctx.record_event("domain_dropped", json!({ "tag": dropped })).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 有界规划循环：分解 + 校验，规划期错误消耗重规划预算
    async fn plan_goal(
        &self,
        goal: &Goal,
        tags: &[String],
        ctx: &SessionContext,
    ) -> Result<Plan, OrchestratorError> {
        let attempts = ctx.config.session.max_replans + 1;
        let hint = {
            let shared = ctx.shared_memory.lock().await;
            shared
                .get(MemoryKind::Procedural, &procedural_key(tags))
                .map(|r| r.value.to_string())
        };

        let mut last_reason = String::new();
        for attempt in 1..=attempts {
            let summaries = ctx.registry.summaries();
            let candidate = match self
                .decomposer
                .decompose(goal, tags, &summaries, hint.as_deref())
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    last_reason = e.to_string();
                    ctx.emit(SessionEvent::ValidationFailed {
                        attempt,
                        reason: last_reason.clone(),
                    });
                    ctx.record_event("planning_rejected", json!({ "attempt": attempt, "reason": last_reason }))
                        .await;
                    continue;
                }
            };
            match validate(&candidate, &ctx.registry)
                .map(|_| ())
                .and_then(|_| self.ensure_required_loaded(&candidate, ctx))
            {
                Ok(()) => return Ok(candidate),
                Err(e) => {
                    last_reason = e.to_string();
                    ctx.emit(SessionEvent::ValidationFailed {
                        attempt,
                        reason: last_reason.clone(),
                    });
                    ctx.record_event("planning_rejected", json!({ "attempt": attempt, "reason": last_reason }))
                        .await;
                }
            }
        }
        Err(OrchestratorError::PlanningFailed {
            attempts,
            reason: last_reason,
        })
    }

    /// 计划需求可能落在分类未覆盖的已安装包里，按需补装
    fn ensure_required_loaded(&self, plan: &Plan, ctx: &SessionContext) -> Result<(), OrchestratorError> {
        let mut tags: BTreeSet<String> = BTreeSet::new();
        for requirement in plan.distinct_requirements() {
            if let Some(tag) = ctx.registry.resolve_tag(&requirement) {
                tags.insert(tag);
            }
        }
        let tags: Vec<String> = tags.into_iter().collect();
        ctx.registry.load(&tags)?;
        Ok(())
    }

    /// 执行 - 反思迭代循环
    async fn drive(
        &self,
        mut plan: Plan,
        tags: &[String],
        ctx: &SessionContext,
    ) -> Result<SessionReport, OrchestratorError> {
        let max_iterations = ctx.config.session.max_iterations.max(1);
        let mut iterations = 0u32;
        let outcome = loop {
            iterations += 1;
            let state = match self.scheduler.run(&mut plan, ctx).await {
                Ok(s) => s,
                Err(OrchestratorError::Cancelled) | Err(OrchestratorError::SessionTimeout) => {
                    break SessionOutcome::Aborted;
                }
                Err(e) => return Err(e),
            };
            match state {
                TerminalState::Complete => {
                    self.remember_plan_shape(&plan, tags, ctx).await;
                    break SessionOutcome::Complete;
                }
                TerminalState::Partial { .. } => {
                    let succeeded_any = plan
                        .subtasks
                        .values()
                        .any(|t| t.status == SubtaskStatus::Succeeded);
                    if iterations >= max_iterations {
                        break if succeeded_any {
                            SessionOutcome::Partial
                        } else {
                            SessionOutcome::Failed
                        };
                    }
                    match self.replan(&mut plan, ctx).await {
                        Ok(regenerated) => {
                            ctx.emit(SessionEvent::Replan {
                                version: plan.version,
                                regenerated,
                            });
                        }
                        Err(e) => {
                            warn!(session_id = %ctx.session_id, error = %e, "replanning failed, settling for partial result");
                            ctx.record_event("replan_failed", json!({ "reason": e.to_string() })).await;
                            break if succeeded_any {
                                SessionOutcome::Partial
                            } else {
                                SessionOutcome::Failed
                            };
                        }
                    }
                }
            }
        };

        let report = SessionReport {
            session_id: ctx.session_id.clone(),
            outcome,
            summary: self.synthesize(&plan, outcome, ctx).await,
            failed: plan.ids_with_status(SubtaskStatus::Failed),
            skipped: plan.ids_with_status(SubtaskStatus::Skipped),
            iterations,
        };
        ctx.emit(SessionEvent::ReportReady {
            outcome: outcome.as_str().to_string(),
        });
        Ok(report)
    }

    /// 反思后重规划：保留已成功的子任务，失败与跳过部分重新分解。
    /// 旧版本计划先归档进 Episodic 记忆
    async fn replan(&self, plan: &mut Plan, ctx: &SessionContext) -> Result<usize, OrchestratorError> {
        let archived = serde_json::to_value(&*plan)
            .map_err(|e| OrchestratorError::Memory(format!("archive plan: {}", e)))?;
        ctx.record_event("plan_replaced", archived).await;

        let mut incomplete: Vec<(SubtaskId, String)> = plan
            .subtasks
            .values()
            .filter(|t| matches!(t.status, SubtaskStatus::Failed | SubtaskStatus::Skipped))
            .map(|t| (t.id.clone(), t.description.clone()))
            .collect();
        incomplete.sort();
        let frontier: BTreeSet<SubtaskId> = plan
            .subtasks
            .values()
            .filter(|t| t.status == SubtaskStatus::Succeeded)
            .map(|t| t.id.clone())
            .collect();

        let replacements = self
            .decomposer
            .decompose_remainder(&plan.goal, &incomplete, &frontier, &ctx.registry.summaries())
            .await?;

        plan.subtasks.retain(|_, t| t.status == SubtaskStatus::Succeeded);
        let regenerated = replacements.len();
        for task in replacements {
            if plan.subtasks.contains_key(&task.id) {
                return Err(OrchestratorError::Decomposition(format!(
                    "replacement subtask id '{}' collides with a completed subtask",
                    task.id
                )));
            }
            plan.subtasks.insert(task.id.clone(), task);
        }
        plan.version += 1;

        validate(plan, &ctx.registry)?;
        self.ensure_required_loaded(plan, ctx)?;
        Ok(regenerated)
    }

    /// 完成的计划形状写入 Procedural 记忆，供同类目标复用
    async fn remember_plan_shape(&self, plan: &Plan, tags: &[String], ctx: &SessionContext) {
        let mut shape: Vec<serde_json::Value> = plan
            .subtasks
            .values()
            .map(|t| {
                json!({
                    "id": t.id,
                    "description": t.description,
                    "requires": t.requires,
                    "depends_on": t.depends_on,
                })
            })
            .collect();
        shape.sort_by_key(|v| v["id"].as_str().unwrap_or_default().to_string());

        let key = procedural_key(tags);
        let mut shared = ctx.shared_memory.lock().await;
        if let Err(e) = shared.put(
            MemoryKind::Procedural,
            &ctx.session_id,
            &key,
            json!({ "subtasks": shape }),
        ) {
            warn!(session_id = %ctx.session_id, error = %e, "failed to persist plan shape");
        }
    }

    /// 从 Episodic 事件流合成单段总结
    async fn synthesize(&self, plan: &Plan, outcome: SessionOutcome, ctx: &SessionContext) -> String {
        let memory = ctx.memory.lock().await;
        let counts = memory.event_counts();
        let succeeded = plan
            .subtasks
            .values()
            .filter(|t| t.status == SubtaskStatus::Succeeded)
            .count();
        let retries = counts.get("retry_scheduled").copied().unwrap_or(0);
        let replans = counts.get("plan_replaced").copied().unwrap_or(0);
        format!(
            "goal '{}' finished {}: {}/{} subtasks succeeded over {} event(s), {} retr{}, {} replan(s)",
            plan.goal.text,
            outcome.as_str(),
            succeeded,
            plan.subtasks.len(),
            memory.events().len(),
            retries,
            if retries == 1 { "y" } else { "ies" },
            replans,
        )
    }
}

fn procedural_key(tags: &[String]) -> String {
    format!("plan:{}", tags.join("+"))
}
