//! Hive - 长程任务编排引擎
//!
//! 模块划分：
//! - **capability**: 能力注册表（核心集 + 按领域加载）、领域分类器、带超时的能力调用
//! - **checkpoint**: 计划状态的持久化快照（按会话追加，支持恢复）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排错误分类
//! - **llm**: 提案接口抽象（LLM 边界）与 Mock 实现
//! - **memory**: 四类记忆（Working / Episodic / Semantic / Procedural）
//! - **plan**: 目标分解、依赖图、计划校验
//! - **scheduler**: 依赖调度执行器（重试 / 退避 / 校验门 / 检查点）
//! - **session**: Agent 主循环（分类 → 加载 → 分解 → 校验 → 执行 → 反思 → 汇总）
//! - **subagent**: 隔离子智能体（受限能力子集 + 私有记忆）

pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod plan;
pub mod scheduler;
pub mod session;
pub mod subagent;
