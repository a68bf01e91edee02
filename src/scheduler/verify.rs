//! 成功判据校验
//!
//! 两级判据：形如 `field >= 0.85` 的阈值断言直接对输出 JSON 求值；
//! 其余判据交给提案接口裁决，回答以 OK 开头视为通过。校验只产生
//! 判定结果，不改变子任务状态。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::llm::ProposalClient;

/// 判据裁决结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

fn threshold_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][\w.]*)\s*(>=|<=|==|>|<)\s*(-?\d+(?:\.\d+)?)\s*$")
            .unwrap_or_else(|e| panic!("threshold pattern: {e}"))
    })
}

/// 判据校验器
pub struct Verifier {
    client: Arc<dyn ProposalClient>,
}

impl Verifier {
    pub fn new(client: Arc<dyn ProposalClient>) -> Self {
        Self { client }
    }

    /// 对子任务输出裁决判据
    pub async fn verify(&self, description: &str, criteria: &str, output: &Value) -> Verdict {
        if let Some(captures) = threshold_pattern().captures(criteria) {
            return check_threshold(
                &captures[1],
                &captures[2],
                &captures[3],
                output,
            );
        }
        self.verify_by_proposal(description, criteria, output).await
    }

    async fn verify_by_proposal(&self, description: &str, criteria: &str, output: &Value) -> Verdict {
        let context = format!(
            "Judge whether this subtask output satisfies the criteria.\n\
             Reply OK if it does, otherwise explain the failure.\n\
             Subtask: {}\nCriteria: {}\nOutput: {}",
            description, criteria, output
        );
        match self.client.propose(&context, &[]).await {
            Ok(crate::llm::Proposal::FinalAnswer(answer)) => {
                if answer.trim_start().starts_with("OK") {
                    Verdict::Pass
                } else {
                    Verdict::Fail(answer)
                }
            }
            Ok(_) => Verdict::Fail("verifier returned no final answer".to_string()),
            Err(e) => Verdict::Fail(format!("verification proposal failed: {}", e)),
        }
    }
}

/// 阈值断言求值。字段名支持点号路径；输出本身是数字时可用裸 `value` 引用
fn check_threshold(field: &str, op: &str, rhs: &str, output: &Value) -> Verdict {
    let actual = match lookup_number(field, output) {
        Some(n) => n,
        None => {
            return Verdict::Fail(format!(
                "output has no numeric field '{}' (output: {})",
                field, output
            ));
        }
    };
    let expected: f64 = match rhs.parse() {
        Ok(n) => n,
        Err(_) => return Verdict::Fail(format!("malformed threshold '{}'", rhs)),
    };

    let pass = match op {
        ">=" => actual >= expected,
        "<=" => actual <= expected,
        ">" => actual > expected,
        "<" => actual < expected,
        "==" => (actual - expected).abs() < f64::EPSILON,
        _ => false,
    };
    debug!(field, op, expected, actual, pass, "threshold criteria evaluated");
    if pass {
        Verdict::Pass
    } else {
        Verdict::Fail(format!(
            "criteria '{} {} {}' not met: actual {}",
            field, op, rhs, actual
        ))
    }
}

fn lookup_number(field: &str, output: &Value) -> Option<f64> {
    if field == "value" {
        if let Some(n) = output.as_f64() {
            return Some(n);
        }
    }
    let mut current = output;
    for part in field.split('.') {
        current = current.get(part)?;
    }
    current.as_f64()
}
