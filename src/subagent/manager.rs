//! 子智能体管理器
//!
//! 委派子任务在隔离环境中执行：私有工作记忆、受限能力集、独立时间与
//! 步数预算。允许集必须是父会话已装载能力集的严格子集，保证委派
//! 链的能力范围单调收缩。join 超时则取消子任务并返回 SubAgentTimeout。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::CapabilityInvoker;
use crate::core::{CapabilityFault, OrchestratorError};
use crate::memory::SessionMemory;
use crate::plan::Subtask;

/// 子智能体的最终产出：合并结果 + 单段文本摘要
#[derive(Debug, Clone)]
pub struct SubAgentOutcome {
    pub result: Value,
    pub summary: String,
}

/// 运行中的子智能体句柄
#[derive(Debug)]
pub struct SubAgentHandle {
    pub id: String,
    join: JoinHandle<Result<SubAgentOutcome, OrchestratorError>>,
    cancel: CancellationToken,
}

struct SubAgentRecord {
    parent_session: String,
    subtask_id: String,
}

/// 子智能体管理器
pub struct SubAgentManager {
    invoker: Arc<CapabilityInvoker>,
    timeout: Duration,
    max_iterations: usize,
    arena: Mutex<HashMap<String, SubAgentRecord>>,
}

impl SubAgentManager {
    pub fn new(invoker: Arc<CapabilityInvoker>, timeout: Duration, max_iterations: usize) -> Self {
        Self {
            invoker,
            timeout,
            max_iterations,
            arena: Mutex::new(HashMap::new()),
        }
    }

    /// 委派一个子任务。允许集取子任务的能力需求；必须是父会话
    /// 当前已装载能力集的严格子集，否则拒绝
    pub fn spawn(
        &self,
        subtask: &Subtask,
        goal_text: &str,
        parent_session: &str,
    ) -> Result<SubAgentHandle, OrchestratorError> {
        let active: BTreeSet<String> = self.invoker.registry().active_names().into_iter().collect();
        let allowed = &subtask.requires;

        if !allowed.is_subset(&active) || allowed.len() >= active.len() {
            return Err(OrchestratorError::FatalSubtask {
                subtask: subtask.id.clone(),
                reason: format!(
                    "delegated capability set {:?} is not a strict subset of the parent's loaded set",
                    allowed
                ),
            });
        }
        if allowed.len() > self.max_iterations {
            return Err(OrchestratorError::FatalSubtask {
                subtask: subtask.id.clone(),
                reason: format!(
                    "delegation requires {} steps, sub-agent budget is {}",
                    allowed.len(),
                    self.max_iterations
                ),
            });
        }

        let id = Uuid::new_v4().to_string();
        {
            let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
            arena.insert(
                id.clone(),
                SubAgentRecord {
                    parent_session: parent_session.to_string(),
                    subtask_id: subtask.id.clone(),
                },
            );
        }
        info!(
            sub_agent = %id,
            subtask = %subtask.id,
            allowed = ?allowed,
            "sub-agent spawned"
        );

        let cancel = CancellationToken::new();
        let invoker = self.invoker.clone();
        let task = subtask.clone();
        let goal = goal_text.to_string();
        let agent_id = id.clone();
        let child_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            run_sub_agent(invoker, task, goal, agent_id, child_cancel).await
        });

        Ok(SubAgentHandle { id, join, cancel })
    }

    /// 等待子智能体完成；超过时间预算则取消并返回 SubAgentTimeout
    pub async fn join(&self, handle: SubAgentHandle) -> Result<SubAgentOutcome, OrchestratorError> {
        let SubAgentHandle { id, join, cancel } = handle;
        let outcome = match tokio::time::timeout(self.timeout, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(OrchestratorError::FatalSubtask {
                subtask: id.clone(),
                reason: format!("sub-agent task panicked: {}", e),
            }),
            Err(_) => {
                warn!(sub_agent = %id, "sub-agent exceeded its time budget, cancelling");
                cancel.cancel();
                Err(OrchestratorError::SubAgentTimeout(id.clone()))
            }
        };
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        arena.remove(&id);
        outcome
    }

    /// 当前在途的子智能体数量
    pub fn in_flight(&self) -> usize {
        self.arena.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 指定会话名下的在途子智能体（升序）
    pub fn in_flight_for(&self, parent_session: &str) -> Vec<String> {
        let arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<String> = arena
            .iter()
            .filter(|(_, r)| r.parent_session == parent_session)
            .map(|(_, r)| r.subtask_id.clone())
            .collect();
        out.sort();
        out
    }
}

/// 子智能体主体：在私有工作记忆里按名字顺序逐个调用允许的能力，
/// 合并输出并生成摘要
async fn run_sub_agent(
    invoker: Arc<CapabilityInvoker>,
    subtask: Subtask,
    goal_text: String,
    agent_id: String,
    cancel: CancellationToken,
) -> Result<SubAgentOutcome, OrchestratorError> {
    let mut memory = SessionMemory::new(agent_id.clone());
    memory.set_working("goal", json!(goal_text));
    memory.set_working("subtask", json!(subtask.description));

    let mut merged = serde_json::Map::new();
    for name in &subtask.requires {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let args = json!({
            "text": subtask.description,
            "context": memory.working("goal").cloned().unwrap_or(Value::Null),
        });
        // 故障等级原样外传：瞬时故障留给父调度器按退避重试
        let output = invoker
            .invoke(name, args, cancel.clone())
            .await
            .map_err(|fault| {
                let reason = format!("sub-agent capability '{}': {}", name, fault);
                match fault {
                    CapabilityFault::Transient(_) => OrchestratorError::TransientSubtask {
                        subtask: subtask.id.clone(),
                        reason,
                    },
                    CapabilityFault::Fatal(_) => OrchestratorError::FatalSubtask {
                        subtask: subtask.id.clone(),
                        reason,
                    },
                }
            })?;
        memory.record_event("capability_invoked", json!({ "capability": name }));
        merged.insert(name.clone(), output);
    }

    let steps = memory.events().len();
    let result = if merged.len() == 1 {
        merged.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
    } else {
        Value::Object(merged)
    };
    let summary = format!(
        "sub-agent completed '{}' in {} step(s)",
        subtask.description, steps
    );
    Ok(SubAgentOutcome { result, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::registry::{
        CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, DomainPack,
    };
    use async_trait::async_trait;

    struct Fixed(Value);

    #[async_trait]
    impl CapabilityHandler for Fixed {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            Ok(self.0.clone())
        }
    }

    struct TransientFault;

    #[async_trait]
    impl CapabilityHandler for TransientFault {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            Err(CapabilityFault::Transient("connection reset".to_string()))
        }
    }

    struct Stuck;

    #[async_trait]
    impl CapabilityHandler for Stuck {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(Value::Null)
        }
    }

    fn descriptor(name: &str, handler: Arc<dyn CapabilityHandler>) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: name.to_string(),
            domain: "test".to_string(),
            description: String::new(),
            input_schema: json!({}),
            output_schema: json!({}),
            handler,
        }
    }

    fn invoker(caps: Vec<CapabilityDescriptor>) -> Arc<CapabilityInvoker> {
        let registry = Arc::new(CapabilityRegistry::new(10));
        registry
            .install_pack(DomainPack {
                tag: "test".to_string(),
                capabilities: caps,
            })
            .unwrap();
        registry.load(&["test".to_string()]).unwrap();
        Arc::new(CapabilityInvoker::new(registry, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_delegation_runs_with_restricted_set() {
        let invoker = invoker(vec![
            descriptor("summarize", Arc::new(Fixed(json!({"value": 0.9})))),
            descriptor("extract", Arc::new(Fixed(json!({"rows": 3})))),
        ]);
        let manager = SubAgentManager::new(invoker, Duration::from_secs(5), 8);

        let subtask = Subtask::new("t1", "summarize the report").with_requires(["summarize"]);
        let handle = manager.spawn(&subtask, "goal", "session-1").unwrap();
        let outcome = manager.join(handle).await.unwrap();
        assert_eq!(outcome.result, json!({"value": 0.9}));
        assert!(outcome.summary.contains("1 step"));
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_non_strict_subset_is_rejected() {
        let invoker = invoker(vec![descriptor("summarize", Arc::new(Fixed(Value::Null)))]);
        let manager = SubAgentManager::new(invoker, Duration::from_secs(5), 8);

        // 允许集等于父集，不是严格子集
        let subtask = Subtask::new("t1", "do everything").with_requires(["summarize"]);
        let err = manager.spawn(&subtask, "goal", "session-1").unwrap_err();
        assert!(matches!(err, OrchestratorError::FatalSubtask { .. }));
    }

    #[tokio::test]
    async fn test_inner_transient_fault_keeps_its_class() {
        let invoker = invoker(vec![
            descriptor("flaky", Arc::new(TransientFault)),
            descriptor("other", Arc::new(Fixed(Value::Null))),
        ]);
        let manager = SubAgentManager::new(invoker, Duration::from_secs(5), 8);

        let subtask = Subtask::new("t1", "flaky step").with_requires(["flaky"]);
        let handle = manager.spawn(&subtask, "goal", "session-1").unwrap();
        let err = manager.join(handle).await.unwrap_err();
        match err {
            OrchestratorError::TransientSubtask { reason, .. } => {
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_capability_is_rejected_at_spawn() {
        let invoker = invoker(vec![
            descriptor("summarize", Arc::new(Fixed(Value::Null))),
            descriptor("extract", Arc::new(Fixed(Value::Null))),
        ]);
        let manager = SubAgentManager::new(invoker, Duration::from_secs(5), 8);

        let subtask = Subtask::new("t1", "mystery").with_requires(["ghost"]);
        let err = manager.spawn(&subtask, "goal", "session-1").unwrap_err();
        assert!(matches!(err, OrchestratorError::FatalSubtask { .. }));
    }

    #[tokio::test]
    async fn test_in_flight_tracks_per_parent_session() {
        let invoker = invoker(vec![
            descriptor("stuck", Arc::new(Stuck)),
            descriptor("other", Arc::new(Fixed(Value::Null))),
        ]);
        let manager = SubAgentManager::new(invoker, Duration::from_millis(50), 8);

        let subtask = Subtask::new("t1", "long running").with_requires(["stuck"]);
        let handle = manager.spawn(&subtask, "goal", "session-1").unwrap();
        assert_eq!(manager.in_flight_for("session-1"), vec!["t1".to_string()]);
        assert!(manager.in_flight_for("session-2").is_empty());

        let _ = manager.join(handle).await;
        assert!(manager.in_flight_for("session-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_cancels_and_reports() {
        let invoker = invoker(vec![
            descriptor("stuck", Arc::new(Stuck)),
            descriptor("other", Arc::new(Fixed(Value::Null))),
        ]);
        let manager = SubAgentManager::new(invoker, Duration::from_millis(50), 8);

        let subtask = Subtask::new("t1", "never finishes").with_requires(["stuck"]);
        let handle = manager.spawn(&subtask, "goal", "session-1").unwrap();
        let err = manager.join(handle).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SubAgentTimeout(_)));
        assert_eq!(manager.in_flight(), 0);
    }
}
