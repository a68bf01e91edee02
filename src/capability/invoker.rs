//! 能力调用器
//!
//! 统一调用入口：解析已装载能力、施加单次调用超时、输出审计日志。
//! 超时对可重试能力折算为瞬时故障，对不可重试能力折算为致命故障。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capability::registry::CapabilityRegistry;
use crate::core::CapabilityFault;

const ARGS_PREVIEW_LEN: usize = 120;

/// 能力调用器：注册表 + 单次调用超时
pub struct CapabilityInvoker {
    registry: Arc<CapabilityRegistry>,
    timeout: Duration,
}

impl CapabilityInvoker {
    pub fn new(registry: Arc<CapabilityRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// 调用一个已装载的能力
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<Value, CapabilityFault> {
        let descriptor = self
            .registry
            .resolve(name)
            .ok_or_else(|| CapabilityFault::Fatal(format!("capability '{}' is not loaded", name)))?;

        let args_preview = preview(&args);
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, descriptor.handler.invoke(args, cancel)).await;

        match outcome {
            Ok(Ok(output)) => {
                info!(
                    target: "capability_audit",
                    capability = %name,
                    domain = %descriptor.domain,
                    args = %args_preview,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = true,
                    "capability invoked"
                );
                Ok(output)
            }
            Ok(Err(fault)) => {
                warn!(
                    target: "capability_audit",
                    capability = %name,
                    args = %args_preview,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = false,
                    fault = %fault,
                    "capability invocation faulted"
                );
                Err(fault)
            }
            Err(_) => {
                let fault = if descriptor.handler.retryable() {
                    CapabilityFault::Transient(format!(
                        "capability '{}' timed out after {:?}",
                        name, self.timeout
                    ))
                } else {
                    CapabilityFault::Fatal(format!(
                        "non-retryable capability '{}' timed out after {:?}",
                        name, self.timeout
                    ))
                };
                warn!(
                    target: "capability_audit",
                    capability = %name,
                    args = %args_preview,
                    ok = false,
                    fault = %fault,
                    "capability invocation timed out"
                );
                Err(fault)
            }
        }
    }
}

fn preview(args: &Value) -> String {
    let mut text = args.to_string();
    if text.len() > ARGS_PREVIEW_LEN {
        let mut cut = ARGS_PREVIEW_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::registry::{CapabilityDescriptor, CapabilityHandler, DomainPack};
    use async_trait::async_trait;
    use serde_json::json;

    struct Slow {
        retryable: bool,
    }

    #[async_trait]
    impl CapabilityHandler for Slow {
        async fn invoke(&self, _args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }

        fn retryable(&self) -> bool {
            self.retryable
        }
    }

    struct Double;

    #[async_trait]
    impl CapabilityHandler for Double {
        async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
            let n = args
                .get("value")
                .and_then(Value::as_f64)
                .ok_or_else(|| CapabilityFault::Fatal("missing numeric 'value'".to_string()))?;
            Ok(json!({ "value": n * 2.0 }))
        }
    }

    fn registry_with(name: &str, handler: Arc<dyn CapabilityHandler>) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(CapabilityRegistry::new(10));
        registry
            .install_pack(DomainPack {
                tag: "test".to_string(),
                capabilities: vec![CapabilityDescriptor {
                    name: name.to_string(),
                    domain: "test".to_string(),
                    description: "test capability".to_string(),
                    input_schema: json!({}),
                    output_schema: json!({}),
                    handler,
                }],
            })
            .unwrap();
        registry.load(&["test".to_string()]).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_invoke_returns_handler_output() {
        let invoker = CapabilityInvoker::new(registry_with("double", Arc::new(Double)), Duration::from_secs(5));
        let out = invoker
            .invoke("double", json!({"value": 21.0}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"value": 42.0}));
    }

    #[tokio::test]
    async fn test_unknown_capability_is_fatal() {
        let invoker = CapabilityInvoker::new(registry_with("double", Arc::new(Double)), Duration::from_secs(5));
        let fault = invoker
            .invoke("ghost", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(fault, CapabilityFault::Fatal(_)));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient_for_retryable() {
        let invoker = CapabilityInvoker::new(
            registry_with("slow", Arc::new(Slow { retryable: true })),
            Duration::from_millis(20),
        );
        let fault = invoker
            .invoke("slow", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(fault.is_transient());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_fatal_for_non_retryable() {
        let invoker = CapabilityInvoker::new(
            registry_with("slow", Arc::new(Slow { retryable: false })),
            Duration::from_millis(20),
        );
        let fault = invoker
            .invoke("slow", json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(fault, CapabilityFault::Fatal(_)));
    }
}
