//! 内置核心能力包
//!
//! echo 原样返回输入（带 value 字段便于阈值判据测试），note 把文本追加到
//! 共享接收器。两者幂等、无外部依赖，是常驻 core 包的最小能力集。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::capability::registry::{CapabilityDescriptor, CapabilityHandler, DomainPack, CORE_TAG};
use crate::core::CapabilityFault;

struct EchoCapability;

#[async_trait]
impl CapabilityHandler for EchoCapability {
    async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(json!({ "text": text, "value": 1.0 }))
    }
}

struct NoteCapability {
    sink: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl CapabilityHandler for NoteCapability {
    async fn invoke(&self, args: Value, _cancel: CancellationToken) -> Result<Value, CapabilityFault> {
        // 调度器的通用参数只带 text；显式 note 优先
        let note = args
            .get("note")
            .or_else(|| args.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityFault::Fatal("missing string 'note' or 'text'".to_string()))?;
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        sink.push(note.to_string());
        Ok(json!({ "noted": true, "count": sink.len() }))
    }
}

/// 构建常驻核心包；sink 收集 note 能力写入的文本
pub fn core_pack(sink: Arc<Mutex<Vec<String>>>) -> DomainPack {
    DomainPack {
        tag: CORE_TAG.to_string(),
        capabilities: vec![
            CapabilityDescriptor {
                name: "echo".to_string(),
                domain: CORE_TAG.to_string(),
                description: "Return the input text unchanged".to_string(),
                input_schema: json!({ "text": "string" }),
                output_schema: json!({ "text": "string", "value": "number" }),
                handler: Arc::new(EchoCapability),
            },
            CapabilityDescriptor {
                name: "note".to_string(),
                domain: CORE_TAG.to_string(),
                description: "Append a note to the session notebook".to_string(),
                input_schema: json!({ "note": "string" }),
                output_schema: json!({ "noted": "bool", "count": "number" }),
                handler: Arc::new(NoteCapability { sink }),
            },
        ],
    }
}
