//! 能力注册表
//!
//! 能力按领域包安装，按标签整包装载/卸载。装载前检查能力预算；
//! core 包常驻，空闲卸载时跳过。引用计数跟踪未终态子任务对能力的需求，
//! 计数归零的非核心包可被 unload_idle 回收。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::{CapabilityFault, OrchestratorError};
use crate::llm::CapabilitySummary;

/// 常驻领域标签，装载一次后不再卸载
pub const CORE_TAG: &str = "core";

/// 能力处理器：执行一次调用，返回不透明 JSON 输出或分级故障
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn invoke(&self, args: Value, cancel: CancellationToken) -> Result<Value, CapabilityFault>;

    /// 超时后是否值得重试；幂等能力返回 true
    fn retryable(&self) -> bool {
        true
    }
}

/// 能力描述符：名称全局唯一，schema 仅作提示用途不做强校验
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub domain: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub handler: Arc<dyn CapabilityHandler>,
}

/// 领域包：同一领域标签下的一组能力
pub struct DomainPack {
    pub tag: String,
    pub capabilities: Vec<CapabilityDescriptor>,
}

#[derive(Default)]
struct RegistryState {
    /// 已安装的包：标签 -> 能力描述符
    packs: HashMap<String, Vec<CapabilityDescriptor>>,
    /// 目录：能力名 -> 所属标签（安装即登记，与是否装载无关）
    catalog: HashMap<String, String>,
    /// 当前已装载的标签
    active_tags: HashSet<String>,
    /// 已装载的能力（仅这些可被调用）
    active: HashMap<String, CapabilityDescriptor>,
    /// 能力名 -> 未终态子任务需求数
    refcounts: HashMap<String, usize>,
}

/// 能力注册表（内部 RwLock，装载/解析可跨任务共享）
pub struct CapabilityRegistry {
    state: RwLock<RegistryState>,
    budget: usize,
}

impl CapabilityRegistry {
    pub fn new(budget: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            budget,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// 安装领域包。重名能力视为配置错误
    pub fn install_pack(&self, pack: DomainPack) -> Result<(), OrchestratorError> {
        let mut state = self.write_state();
        for cap in &pack.capabilities {
            if state.catalog.contains_key(&cap.name) {
                return Err(OrchestratorError::Registry(format!(
                    "capability '{}' already installed",
                    cap.name
                )));
            }
        }
        for cap in &pack.capabilities {
            state.catalog.insert(cap.name.clone(), pack.tag.clone());
        }
        debug!(tag = %pack.tag, count = pack.capabilities.len(), "domain pack installed");
        state.packs.insert(pack.tag.clone(), pack.capabilities);
        Ok(())
    }

    /// 装载一组标签；未安装的标签被忽略。超出能力预算时整体拒绝，
    /// 已装载集合保持不变。返回新装载的能力数
    pub fn load(&self, tags: &[String]) -> Result<usize, OrchestratorError> {
        let mut state = self.write_state();

        let mut incoming = 0usize;
        for tag in tags {
            if state.active_tags.contains(tag) {
                continue;
            }
            if let Some(caps) = state.packs.get(tag) {
                incoming += caps.len();
            }
        }
        let requested = state.active.len() + incoming;
        if requested > self.budget {
            return Err(OrchestratorError::CapabilityBudgetExceeded {
                requested,
                budget: self.budget,
            });
        }

        let mut loaded = 0usize;
        for tag in tags {
            if state.active_tags.contains(tag) || !state.packs.contains_key(tag) {
                continue;
            }
            let caps = state.packs.get(tag).cloned().unwrap_or_default();
            for cap in caps {
                state.active.insert(cap.name.clone(), cap);
                loaded += 1;
            }
            state.active_tags.insert(tag.clone());
            info!(tag = %tag, "domain pack loaded");
        }
        Ok(loaded)
    }

    /// 解析已装载的能力
    pub fn resolve(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.read_state().active.get(name).cloned()
    }

    /// 目录级解析：能力名 -> 所属标签（不要求已装载）
    pub fn resolve_tag(&self, name: &str) -> Option<String> {
        self.read_state().catalog.get(name).cloned()
    }

    /// 已装载能力的摘要（按名升序），供提案上下文使用
    pub fn summaries(&self) -> Vec<CapabilitySummary> {
        let state = self.read_state();
        let mut out: Vec<CapabilitySummary> = state
            .active
            .values()
            .map(|c| CapabilitySummary {
                name: c.name.clone(),
                domain: c.domain.clone(),
                description: c.description.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn active_count(&self) -> usize {
        self.read_state().active.len()
    }

    /// 已装载能力名（升序）
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_state().active.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn active_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.read_state().active_tags.iter().cloned().collect();
        tags.sort();
        tags
    }

    /// 登记一组能力需求（子任务进入非终态时调用）
    pub fn retain<'a, I: IntoIterator<Item = &'a String>>(&self, requirements: I) {
        let mut state = self.write_state();
        for name in requirements {
            *state.refcounts.entry(name.clone()).or_insert(0) += 1;
        }
    }

    /// 释放一组能力需求（子任务到达终态时调用）
    pub fn release<'a, I: IntoIterator<Item = &'a String>>(&self, requirements: I) {
        let mut state = self.write_state();
        for name in requirements {
            if let Some(count) = state.refcounts.get_mut(name) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// 卸载所有能力引用计数均为零的非核心包；返回被卸载的标签（升序）
    pub fn unload_idle(&self) -> Vec<String> {
        let mut state = self.write_state();
        let mut unloaded = Vec::new();
        let tags: Vec<String> = state.active_tags.iter().cloned().collect();
        for tag in tags {
            if tag == CORE_TAG {
                continue;
            }
            let caps = match state.packs.get(&tag) {
                Some(c) => c,
                None => continue,
            };
            let idle = caps
                .iter()
                .all(|c| state.refcounts.get(&c.name).copied().unwrap_or(0) == 0);
            if !idle {
                continue;
            }
            let names: Vec<String> = caps.iter().map(|c| c.name.clone()).collect();
            for name in names {
                state.active.remove(&name);
            }
            state.active_tags.remove(&tag);
            info!(tag = %tag, "idle domain pack unloaded");
            unloaded.push(tag);
        }
        unloaded.sort();
        unloaded
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
