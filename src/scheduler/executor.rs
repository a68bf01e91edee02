//! 子任务调度执行器
//!
//! 单驱动循环独占计划状态：工作任务只拿子任务快照，结果经 mpsc 回传，
//! 所有状态变更与检查点写入都在驱动循环内完成，同一会话的检查点写入
//! 因此天然串行。信号量限制同时在途的子任务数；取消与会话超时把剩余
//! 非终态子任务标记为 Skipped 并落一个最终检查点。
//!
//! 终态转换遵循先落盘后传播：状态写入计划、快照确认后，才向依赖方
//! 传播（跳过级联或解锁 Ready）。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::CapabilityInvoker;
use crate::core::{CapabilityFault, OrchestratorError};
use crate::plan::{Plan, SubtaskId, SubtaskResult, SubtaskStatus};
use crate::scheduler::verify::{Verdict, Verifier};
use crate::session::{SessionContext, SessionEvent};
use crate::subagent::SubAgentManager;

/// 一次调度运行的终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    /// 所有子任务 Succeeded
    Complete,
    /// 部分子任务 Failed / Skipped
    Partial {
        failed: Vec<SubtaskId>,
        skipped: Vec<SubtaskId>,
    },
}

/// 指数退避延迟：base × 2^(retry-1)，封顶 cap
pub fn backoff_delay(retry: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = retry.saturating_sub(1).min(20);
    let delay = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
    Duration::from_millis(delay)
}

struct WorkerOutcome {
    id: SubtaskId,
    result: Result<Value, CapabilityFault>,
}

/// 调度器
pub struct Scheduler {
    invoker: Arc<CapabilityInvoker>,
    subagents: Arc<SubAgentManager>,
    verifier: Verifier,
}

impl Scheduler {
    pub fn new(invoker: Arc<CapabilityInvoker>, subagents: Arc<SubAgentManager>, verifier: Verifier) -> Self {
        Self {
            invoker,
            subagents,
            verifier,
        }
    }

    /// 执行计划直到所有子任务到达终态
    pub async fn run(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
    ) -> Result<TerminalState, OrchestratorError> {
        // 登记非终态子任务的能力需求，防止空闲卸载误伤
        for task in plan.subtasks.values() {
            if !task.status.is_terminal() {
                ctx.registry.retain(task.requires.iter());
            }
        }

        let semaphore = Arc::new(Semaphore::new(ctx.config.scheduler.max_concurrent.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerOutcome>();
        let mut running: HashSet<SubtaskId> = HashSet::new();

        loop {
            if ctx.cancel.is_cancelled() {
                self.abort_remaining(plan, ctx, "session cancelled").await?;
                return Err(OrchestratorError::Cancelled);
            }
            if ctx.deadline_passed() {
                self.abort_remaining(plan, ctx, "session wall-clock budget exceeded")
                    .await?;
                return Err(OrchestratorError::SessionTimeout);
            }

            self.advance_pending(plan, ctx).await?;
            self.dispatch_ready(plan, ctx, &semaphore, &tx, &mut running);

            if plan.all_terminal() {
                break;
            }

            // 校验器通过后仍无法推进（理论上校验排除了环与孤儿依赖）
            let has_ready = plan
                .subtasks
                .values()
                .any(|t| t.status == SubtaskStatus::Ready);
            if running.is_empty() && !has_ready {
                warn!(session_id = %ctx.session_id, "no runnable subtask left, skipping remainder");
                self.abort_remaining(plan, ctx, "unschedulable").await?;
                break;
            }

            let wake = self.next_wake(plan);
            tokio::select! {
                _ = ctx.cancel.cancelled() => {}
                outcome = rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.apply_outcome(plan, ctx, outcome, &mut running).await?;
                        while let Ok(extra) = rx.try_recv() {
                            self.apply_outcome(plan, ctx, extra, &mut running).await?;
                        }
                    }
                }
                _ = tokio::time::sleep(wake) => {}
            }
        }

        ctx.registry.unload_idle();
        if plan.all_succeeded() {
            info!(session_id = %ctx.session_id, "plan complete");
            Ok(TerminalState::Complete)
        } else {
            let failed = plan.ids_with_status(SubtaskStatus::Failed);
            let skipped = plan.ids_with_status(SubtaskStatus::Skipped);
            info!(
                session_id = %ctx.session_id,
                failed = failed.len(),
                skipped = skipped.len(),
                "plan partially complete"
            );
            Ok(TerminalState::Partial { failed, skipped })
        }
    }

    /// 传播终态：依赖全部到达终态的 Pending 任务变为 Ready；
    /// 上游失败的非 best_effort 任务被跳过（级联到不动点）
    async fn advance_pending(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
    ) -> Result<(), OrchestratorError> {
        loop {
            let mut to_ready: Vec<(SubtaskId, bool)> = Vec::new();
            let mut to_skip: Vec<(SubtaskId, String)> = Vec::new();

            for id in plan.ids_with_status(SubtaskStatus::Pending) {
                let task = match plan.get(&id) {
                    Some(t) => t,
                    None => continue,
                };
                let mut degraded_by: Option<SubtaskId> = None;
                let mut all_terminal = true;
                for dep in &task.depends_on {
                    match plan.get(dep).map(|d| d.status) {
                        Some(SubtaskStatus::Succeeded) => {}
                        Some(SubtaskStatus::Failed) | Some(SubtaskStatus::Skipped) => {
                            degraded_by.get_or_insert_with(|| dep.clone());
                        }
                        // 替换计划中不存在的外部依赖按已成功处理
                        None => {}
                        _ => all_terminal = false,
                    }
                }
                if !all_terminal {
                    continue;
                }
                match degraded_by {
                    Some(dep) if !task.best_effort => {
                        to_skip.push((id, format!("dependency '{}' did not succeed", dep)));
                    }
                    Some(_) => to_ready.push((id, true)),
                    None => to_ready.push((id, false)),
                }
            }

            if to_ready.is_empty() && to_skip.is_empty() {
                return Ok(());
            }

            for (id, degraded) in to_ready {
                if let Some(task) = plan.get_mut(&id) {
                    task.status = SubtaskStatus::Ready;
                    if degraded {
                        // best_effort 任务带降级输入继续
                        task.degraded_input = true;
                    }
                }
            }
            for (id, reason) in to_skip {
                self.finalize(plan, ctx, &id, SubtaskStatus::Skipped, None, Some(reason))
                    .await?;
            }
        }
    }

    /// 派发 Ready 且退避期已过的子任务；受信号量许可约束
    fn dispatch_ready(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
        semaphore: &Arc<Semaphore>,
        tx: &UnboundedSender<WorkerOutcome>,
        running: &mut HashSet<SubtaskId>,
    ) {
        let now = Instant::now();
        for id in plan.ids_with_status(SubtaskStatus::Ready) {
            let waiting = plan
                .get(&id)
                .and_then(|t| t.next_attempt_at)
                .map(|at| at > now)
                .unwrap_or(false);
            if waiting {
                continue;
            }
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };

            let inputs = self.collect_inputs(plan, &id);
            let task = match plan.get_mut(&id) {
                Some(t) => t,
                None => continue,
            };
            task.status = SubtaskStatus::Running;
            task.next_attempt_at = None;
            let snapshot = task.clone();

            ctx.emit(SessionEvent::SubtaskStarted { id: id.clone() });
            if snapshot.delegate {
                ctx.emit(SessionEvent::SubAgentSpawned { subtask: id.clone() });
            }
            debug!(session_id = %ctx.session_id, subtask = %id, retry = snapshot.retry_count, "subtask dispatched");
            running.insert(id.clone());

            let args = json!({
                "text": snapshot.description,
                "inputs": inputs,
                "degraded": snapshot.degraded_input,
            });
            let invoker = self.invoker.clone();
            let subagents = self.subagents.clone();
            let goal = plan.goal.text.clone();
            let session = ctx.session_id.clone();
            let cancel = ctx.cancel.child_token();
            let memory = ctx.memory.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = if snapshot.delegate {
                    run_delegated(&subagents, &snapshot, &goal, &session, &memory).await
                } else {
                    execute_requirements(&invoker, &snapshot, args, cancel).await
                };
                let _ = tx.send(WorkerOutcome {
                    id: snapshot.id,
                    result,
                });
            });
        }
    }

    /// 工作任务回传的结果：成功则过判据门，瞬时故障按退避重试，
    /// 致命故障立即 Failed
    async fn apply_outcome(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
        outcome: WorkerOutcome,
        running: &mut HashSet<SubtaskId>,
    ) -> Result<(), OrchestratorError> {
        running.remove(&outcome.id);
        let id = outcome.id;
        let (description, criteria) = match plan.get(&id) {
            Some(t) => (t.description.clone(), t.criteria.clone()),
            None => return Ok(()),
        };

        match outcome.result {
            Ok(value) => {
                if let Some(criteria) = criteria {
                    match self.verifier.verify(&description, &criteria, &value).await {
                        Verdict::Pass => {
                            if let Some(task) = plan.get_mut(&id) {
                                task.verified = true;
                            }
                            ctx.emit(SessionEvent::CapabilityResult {
                                subtask: id.clone(),
                                output: value.clone(),
                            });
                            self.finalize(
                                plan,
                                ctx,
                                &id,
                                SubtaskStatus::Succeeded,
                                Some(SubtaskResult::Output(value)),
                                None,
                            )
                            .await
                        }
                        Verdict::Fail(reason) => {
                            ctx.emit(SessionEvent::VerificationRejected {
                                id: id.clone(),
                                reason: reason.clone(),
                            });
                            ctx.record_event(
                                "verification_rejected",
                                json!({ "id": id, "reason": reason }),
                            )
                            .await;
                            self.retry_or_fail(plan, ctx, &id, reason).await
                        }
                    }
                } else {
                    ctx.emit(SessionEvent::CapabilityResult {
                        subtask: id.clone(),
                        output: value.clone(),
                    });
                    self.finalize(
                        plan,
                        ctx,
                        &id,
                        SubtaskStatus::Succeeded,
                        Some(SubtaskResult::Output(value)),
                        None,
                    )
                    .await
                }
            }
            Err(CapabilityFault::Fatal(reason)) => {
                self.finalize(
                    plan,
                    ctx,
                    &id,
                    SubtaskStatus::Failed,
                    Some(SubtaskResult::Error(reason)),
                    None,
                )
                .await
            }
            Err(CapabilityFault::Transient(reason)) => self.retry_or_fail(plan, ctx, &id, reason).await,
        }
    }

    /// 还有重试预算则退避后重跑，否则 Failed
    async fn retry_or_fail(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
        id: &str,
        reason: String,
    ) -> Result<(), OrchestratorError> {
        let cfg = &ctx.config.scheduler;
        let retry = match plan.get_mut(id) {
            Some(task) => {
                task.retry_count += 1;
                task.retry_count
            }
            None => return Ok(()),
        };

        if retry > cfg.max_retries {
            let exhausted = format!("retries exhausted after {} attempts: {}", retry, reason);
            return self
                .finalize(
                    plan,
                    ctx,
                    id,
                    SubtaskStatus::Failed,
                    Some(SubtaskResult::Error(exhausted)),
                    None,
                )
                .await;
        }

        let delay = backoff_delay(retry, cfg.backoff_base_ms, cfg.backoff_cap_ms);
        if let Some(task) = plan.get_mut(id) {
            // 回到 Pending，退避期满后经 Ready 重新派发
            task.status = SubtaskStatus::Pending;
            task.next_attempt_at = Some(Instant::now() + delay);
        }
        ctx.emit(SessionEvent::RetryScheduled {
            id: id.to_string(),
            retry,
            delay_ms: delay.as_millis() as u64,
        });
        ctx.record_event(
            "retry_scheduled",
            json!({ "id": id, "retry": retry, "delay_ms": delay.as_millis() as u64 }),
        )
        .await;
        debug!(session_id = %ctx.session_id, subtask = %id, retry, delay_ms = delay.as_millis() as u64, "retry scheduled");
        Ok(())
    }

    /// 终态转换：写状态、落检查点、再发事件与释放能力引用
    async fn finalize(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
        id: &str,
        status: SubtaskStatus,
        result: Option<SubtaskResult>,
        skip_reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let requires = match plan.get_mut(id) {
            Some(task) => {
                task.status = status;
                if result.is_some() {
                    task.result = result;
                }
                if skip_reason.is_some() {
                    task.skip_reason = skip_reason;
                }
                task.next_attempt_at = None;
                task.requires.clone()
            }
            None => return Ok(()),
        };

        let checkpoint = ctx.checkpoints.append(&ctx.session_id, plan)?;
        ctx.emit(SessionEvent::CheckpointWritten {
            sequence: checkpoint.sequence,
        });
        ctx.emit(SessionEvent::SubtaskFinished {
            id: id.to_string(),
            status: format!("{:?}", status).to_lowercase(),
        });
        ctx.record_event(
            "subtask_finished",
            json!({ "id": id, "status": format!("{:?}", status).to_lowercase() }),
        )
        .await;

        ctx.registry.release(requires.iter());
        Ok(())
    }

    /// 取消或超时：剩余非终态子任务统一标记 Skipped，落一个最终检查点
    async fn abort_remaining(
        &self,
        plan: &mut Plan,
        ctx: &SessionContext,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let mut touched = false;
        let ids: Vec<SubtaskId> = plan
            .subtasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in ids {
            if let Some(task) = plan.get_mut(&id) {
                task.status = SubtaskStatus::Skipped;
                task.skip_reason = Some(reason.to_string());
                task.next_attempt_at = None;
                let requires = task.requires.clone();
                ctx.registry.release(requires.iter());
                touched = true;
            }
        }
        if touched {
            let checkpoint = ctx.checkpoints.append(&ctx.session_id, plan)?;
            ctx.emit(SessionEvent::CheckpointWritten {
                sequence: checkpoint.sequence,
            });
            ctx.record_event("run_aborted", json!({ "reason": reason })).await;
        }
        // 在途子智能体靠 join 超时自行收尾，这里只留审计记录
        let outstanding = self.subagents.in_flight_for(&ctx.session_id);
        if !outstanding.is_empty() {
            warn!(
                session_id = %ctx.session_id,
                subtasks = ?outstanding,
                "sub-agents still in flight at abort"
            );
            ctx.record_event("sub_agents_outstanding", json!({ "subtasks": outstanding }))
                .await;
        }
        ctx.registry.unload_idle();
        Ok(())
    }

    /// 从已成功依赖收集输入载荷
    fn collect_inputs(&self, plan: &Plan, id: &str) -> Value {
        let mut inputs = serde_json::Map::new();
        if let Some(task) = plan.get(id) {
            for dep in &task.depends_on {
                if let Some(SubtaskResult::Output(value)) = plan.get(dep).and_then(|d| d.result.as_ref())
                {
                    inputs.insert(dep.clone(), value.clone());
                }
            }
        }
        Value::Object(inputs)
    }

    /// 下次唤醒间隔：最早的退避截止，封顶 100ms 轮询
    fn next_wake(&self, plan: &Plan) -> Duration {
        let now = Instant::now();
        let mut wake = Duration::from_millis(100);
        for task in plan.subtasks.values() {
            if task.status.is_terminal() {
                continue;
            }
            if let Some(at) = task.next_attempt_at {
                wake = wake.min(at.saturating_duration_since(now));
            }
        }
        wake
    }
}

/// 按名字顺序调用子任务的能力需求。单需求直通输出；多需求合并为对象；
/// 无需求的子任务视为纯编排节点，输出 null
async fn execute_requirements(
    invoker: &CapabilityInvoker,
    snapshot: &crate::plan::Subtask,
    args: Value,
    cancel: CancellationToken,
) -> Result<Value, CapabilityFault> {
    let requires: Vec<&String> = snapshot.requires.iter().collect();
    match requires.len() {
        0 => Ok(Value::Null),
        1 => invoker.invoke(requires[0], args, cancel).await,
        _ => {
            let mut merged = serde_json::Map::new();
            for name in requires {
                if cancel.is_cancelled() {
                    return Err(CapabilityFault::Transient("cancelled".to_string()));
                }
                let output = invoker.invoke(name, args.clone(), cancel.clone()).await?;
                merged.insert(name.clone(), output);
            }
            Ok(Value::Object(merged))
        }
    }
}

async fn run_delegated(
    subagents: &SubAgentManager,
    snapshot: &crate::plan::Subtask,
    goal: &str,
    session: &str,
    memory: &Arc<tokio::sync::Mutex<crate::memory::SessionMemory>>,
) -> Result<Value, CapabilityFault> {
    let handle = subagents
        .spawn(snapshot, goal, session)
        .map_err(|e| CapabilityFault::Fatal(e.to_string()))?;
    match subagents.join(handle).await {
        // 父会话只合并结果载荷和一条摘要事件，内部步骤不可见
        Ok(outcome) => {
            memory.lock().await.record_event(
                "sub_agent_summary",
                json!({ "subtask": snapshot.id, "summary": outcome.summary }),
            );
            Ok(outcome.result)
        }
        Err(OrchestratorError::SubAgentTimeout(id)) => Err(CapabilityFault::Transient(format!(
            "sub-agent '{}' timed out",
            id
        ))),
        // 子智能体内部的瞬时故障保持瞬时等级，走统一退避重试
        Err(OrchestratorError::TransientSubtask { reason, .. }) => {
            Err(CapabilityFault::Transient(reason))
        }
        Err(e) => Err(CapabilityFault::Fatal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::registry::{
        CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, DomainPack,
    };
    use crate::checkpoint::CheckpointStore;
    use crate::config::AppConfig;
    use crate::llm::{MockProposalClient, Proposal, ScriptedProposalClient};
    use crate::memory::SharedMemory;
    use crate::plan::{Goal, Subtask};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct Fixed(Value);

    #[async_trait]
    impl CapabilityHandler for Fixed {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            Ok(self.0.clone())
        }
    }

    struct AlwaysFatal;

    #[async_trait]
    impl CapabilityHandler for AlwaysFatal {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            Err(CapabilityFault::Fatal("bad arguments".to_string()))
        }
    }

    /// 前 n 次瞬时失败，之后成功
    struct FlakyThenOk {
        failures: AtomicU32,
    }

    #[async_trait]
    impl CapabilityHandler for FlakyThenOk {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                Err(CapabilityFault::Transient("connection reset".to_string()))
            } else {
                Ok(json!({"value": 1.0}))
            }
        }
    }

    /// 每次调用产出递增的 value：0.67、0.90、…
    struct Improving {
        calls: AtomicU32,
        values: Vec<f64>,
    }

    #[async_trait]
    impl CapabilityHandler for Improving {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let value = self.values.get(n).copied().unwrap_or(1.0);
            Ok(json!({"value": value}))
        }
    }

    struct EchoArgs;

    #[async_trait]
    impl CapabilityHandler for EchoArgs {
        async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            Ok(args)
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        ctx: SessionContext,
        _dir: tempfile::TempDir,
    }

    fn fixture(handlers: Vec<(&str, Arc<dyn CapabilityHandler>)>) -> Fixture {
        fixture_with(handlers, AppConfig::default(), Vec::new())
    }

    fn fixture_with(
        handlers: Vec<(&str, Arc<dyn CapabilityHandler>)>,
        mut config: AppConfig,
        verifier_script: Vec<Proposal>,
    ) -> Fixture {
        // 测试里退避要快
        config.scheduler.backoff_base_ms = 1;
        config.scheduler.backoff_cap_ms = 10;

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(CapabilityRegistry::new(config.registry.capability_budget));
        registry
            .install_pack(DomainPack {
                tag: "test".to_string(),
                capabilities: handlers
                    .into_iter()
                    .map(|(name, handler)| CapabilityDescriptor {
                        name: name.to_string(),
                        domain: "test".to_string(),
                        description: String::new(),
                        input_schema: json!({}),
                        output_schema: json!({}),
                        handler,
                    })
                    .collect(),
            })
            .unwrap();
        registry.load(&["test".to_string()]).unwrap();

        let invoker = Arc::new(CapabilityInvoker::new(registry.clone(), Duration::from_secs(5)));
        let subagents = Arc::new(SubAgentManager::new(invoker.clone(), Duration::from_secs(5), 8));
        let verifier = Verifier::new(Arc::new(ScriptedProposalClient::new(verifier_script)));
        let scheduler = Scheduler::new(invoker, subagents, verifier);

        let ctx = SessionContext::new(
            config,
            registry,
            Arc::new(Mutex::new(SharedMemory::open(dir.path().join("shared.json")).unwrap())),
            Arc::new(CheckpointStore::new(dir.path().join("checkpoints"), 20)),
            Arc::new(MockProposalClient::new()),
        );
        Fixture {
            scheduler,
            ctx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_linear_chain_completes_with_one_checkpoint_per_subtask() {
        let f = fixture(vec![("echo", Arc::new(EchoArgs))]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![
                Subtask::new("a", "first").with_requires(["echo"]),
                Subtask::new("b", "second").with_requires(["echo"]).with_depends_on(["a"]),
                Subtask::new("c", "third").with_requires(["echo"]).with_depends_on(["b"]),
            ],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(state, TerminalState::Complete);
        assert!(plan.all_succeeded());

        let checkpoints = f.ctx.checkpoints.load_all(&f.ctx.session_id).unwrap();
        assert_eq!(checkpoints.len(), 3);
        // 每个检查点比前一个多一个 Succeeded
        for (i, c) in checkpoints.iter().enumerate() {
            let succeeded = c
                .plan
                .subtasks
                .values()
                .filter(|t| t.status == SubtaskStatus::Succeeded)
                .count();
            assert_eq!(succeeded, i + 1);
        }
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_dependents() {
        let f = fixture(vec![
            ("echo", Arc::new(EchoArgs)),
            ("broken", Arc::new(AlwaysFatal)),
        ]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![
                Subtask::new("a", "ok").with_requires(["echo"]),
                Subtask::new("b", "breaks").with_requires(["broken"]).with_depends_on(["a"]),
                Subtask::new("c", "downstream").with_requires(["echo"]).with_depends_on(["b"]),
            ],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(
            state,
            TerminalState::Partial {
                failed: vec!["b".to_string()],
                skipped: vec!["c".to_string()],
            }
        );
        assert_eq!(plan.get("a").unwrap().status, SubtaskStatus::Succeeded);
        assert!(plan.get("c").unwrap().skip_reason.is_some());
        // 致命故障不消耗重试
        assert_eq!(plan.get("b").unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let f = fixture(vec![(
            "flaky",
            Arc::new(FlakyThenOk {
                failures: AtomicU32::new(2),
            }),
        )]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![Subtask::new("a", "flaky step").with_requires(["flaky"])],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(state, TerminalState::Complete);
        assert_eq!(plan.get("a").unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_becomes_failed() {
        let f = fixture(vec![(
            "flaky",
            Arc::new(FlakyThenOk {
                failures: AtomicU32::new(100),
            }),
        )]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![Subtask::new("a", "hopeless").with_requires(["flaky"])],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(
            state,
            TerminalState::Partial {
                failed: vec!["a".to_string()],
                skipped: vec![],
            }
        );
        match plan.get("a").unwrap().result.as_ref().unwrap() {
            SubtaskResult::Error(reason) => assert!(reason.contains("retries exhausted")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verification_gate_retries_until_threshold_met() {
        let f = fixture(vec![(
            "improve",
            Arc::new(Improving {
                calls: AtomicU32::new(0),
                values: vec![0.67, 0.90],
            }),
        )]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![Subtask::new("a", "improve quality")
                .with_requires(["improve"])
                .with_criteria("value >= 0.85")],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(state, TerminalState::Complete);
        let task = plan.get("a").unwrap();
        assert!(task.verified);
        assert_eq!(task.retry_count, 1);
        match task.result.as_ref().unwrap() {
            SubtaskResult::Output(v) => assert_eq!(v["value"], 0.90),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subtask_without_criteria_is_not_verified() {
        let f = fixture(vec![("echo", Arc::new(EchoArgs))]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![Subtask::new("a", "no gate").with_requires(["echo"])],
        );
        f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        let task = plan.get("a").unwrap();
        assert_eq!(task.status, SubtaskStatus::Succeeded);
        assert!(!task.verified);
    }

    #[tokio::test]
    async fn test_best_effort_runs_with_degraded_input() {
        let f = fixture(vec![
            ("echo", Arc::new(EchoArgs)),
            ("broken", Arc::new(AlwaysFatal)),
        ]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![
                Subtask::new("a", "breaks").with_requires(["broken"]),
                {
                    let mut t = Subtask::new("b", "carries on").with_requires(["echo"]).with_depends_on(["a"]);
                    t.best_effort = true;
                    t
                },
            ],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(
            state,
            TerminalState::Partial {
                failed: vec!["a".to_string()],
                skipped: vec![],
            }
        );
        let b = plan.get("b").unwrap();
        assert_eq!(b.status, SubtaskStatus::Succeeded);
        assert!(b.degraded_input);
        // echo 回显参数，降级标记应传入
        match b.result.as_ref().unwrap() {
            SubtaskResult::Output(v) => assert_eq!(v["degraded"], true),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_requirements_complete_with_null_output() {
        let f = fixture(vec![]);
        let mut plan = Plan::new(Goal::new("g"), vec![Subtask::new("a", "pure orchestration")]);
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(state, TerminalState::Complete);
        match plan.get("a").unwrap().result.as_ref().unwrap() {
            SubtaskResult::Output(v) => assert!(v.is_null()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_skips_remaining_with_final_checkpoint() {
        let f = fixture(vec![("echo", Arc::new(EchoArgs))]);
        f.ctx.cancel.cancel();
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![
                Subtask::new("a", "never starts").with_requires(["echo"]),
                Subtask::new("b", "never starts").with_requires(["echo"]).with_depends_on(["a"]),
            ],
        );
        let err = f.scheduler.run(&mut plan, &f.ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(plan.all_terminal());
        assert_eq!(plan.ids_with_status(SubtaskStatus::Skipped).len(), 2);
        assert_eq!(
            plan.get("a").unwrap().skip_reason.as_deref(),
            Some("session cancelled")
        );
        let checkpoints = f.ctx.checkpoints.load_all(&f.ctx.session_id).unwrap();
        assert_eq!(checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_delegated_subtask_merges_only_result_and_summary() {
        let f = fixture(vec![
            ("summarize", Arc::new(Fixed(json!({"value": 0.8})))),
            ("echo", Arc::new(EchoArgs)),
        ]);
        let mut plan = Plan::new(Goal::new("g"), vec![{
            let mut t = Subtask::new("d", "summarize in isolation").with_requires(["summarize"]);
            t.delegate = true;
            t
        }]);
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(state, TerminalState::Complete);
        match plan.get("d").unwrap().result.as_ref().unwrap() {
            SubtaskResult::Output(v) => assert_eq!(v["value"], 0.8),
            other => panic!("unexpected result: {other:?}"),
        }
        let memory = f.ctx.memory.lock().await;
        assert_eq!(memory.event_counts().get("sub_agent_summary"), Some(&1));
    }

    #[tokio::test]
    async fn test_delegated_transient_fault_retries_like_direct() {
        let f = fixture(vec![
            (
                "flaky",
                Arc::new(FlakyThenOk {
                    failures: AtomicU32::new(1),
                }),
            ),
            ("echo", Arc::new(EchoArgs)),
        ]);
        let mut plan = Plan::new(Goal::new("g"), vec![{
            let mut t = Subtask::new("d", "flaky in isolation").with_requires(["flaky"]);
            t.delegate = true;
            t
        }]);
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        // 子智能体内的瞬时故障与直接执行同样消耗重试预算而非立即失败
        assert_eq!(state, TerminalState::Complete);
        let task = plan.get("d").unwrap();
        assert_eq!(task.retry_count, 1);
        match task.result.as_ref().unwrap() {
            SubtaskResult::Output(v) => assert_eq!(v["value"], 1.0),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_diamond_runs_both_branches() {
        let f = fixture(vec![("echo", Arc::new(EchoArgs))]);
        let mut plan = Plan::new(
            Goal::new("g"),
            vec![
                Subtask::new("a", "root").with_requires(["echo"]),
                Subtask::new("b", "left").with_requires(["echo"]).with_depends_on(["a"]),
                Subtask::new("c", "right").with_requires(["echo"]).with_depends_on(["a"]),
                Subtask::new("d", "join").with_requires(["echo"]).with_depends_on(["b", "c"]),
            ],
        );
        let state = f.scheduler.run(&mut plan, &f.ctx).await.unwrap();
        assert_eq!(state, TerminalState::Complete);
        // join 节点拿到两个分支的输出
        match plan.get("d").unwrap().result.as_ref().unwrap() {
            SubtaskResult::Output(v) => {
                assert!(v["inputs"].get("b").is_some());
                assert!(v["inputs"].get("c").is_some());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let base = 500;
        let cap = 30_000;
        let mut last = Duration::ZERO;
        for retry in 1..=10 {
            let delay = backoff_delay(retry, base, cap);
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(cap));
            last = delay;
        }
        assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_millis(1000));
        assert_eq!(backoff_delay(10, base, cap), Duration::from_millis(30_000));
    }
}
