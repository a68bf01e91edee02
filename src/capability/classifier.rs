//! 领域分类器
//!
//! 按关键词规则将目标文本映射到领域标签。确定性：同一文本永远得到
//! 同一标签序列（得分降序，平分按标签升序），core 恒为首位。

use std::collections::HashMap;

use tracing::debug;

use crate::capability::registry::CORE_TAG;

/// 单条规则：关键词命中一次计一分
struct DomainRule {
    tag: &'static str,
    keywords: &'static [&'static str],
}

const RULES: &[DomainRule] = &[
    DomainRule {
        tag: "code",
        keywords: &[
            "code", "compile", "refactor", "函数", "代码", "编译", "测试用例", "bug",
            "lint", "重构",
        ],
    },
    DomainRule {
        tag: "web",
        keywords: &[
            "web", "http", "url", "网页", "抓取", "搜索", "fetch", "crawl", "下载",
        ],
    },
    DomainRule {
        tag: "data",
        keywords: &[
            "data", "csv", "json", "统计", "数据", "分析", "aggregate", "chart", "汇总",
        ],
    },
    DomainRule {
        tag: "files",
        keywords: &[
            "file", "directory", "文件", "目录", "整理", "rename", "归档", "move",
        ],
    },
    DomainRule {
        tag: "simulation",
        keywords: &[
            "simulate", "simulation", "模拟", "仿真", "monte carlo", "采样", "轨迹",
        ],
    },
];

/// 目标 -> 领域标签序列
pub struct DomainClassifier;

impl DomainClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 分类目标文本。core 始终在首位，其余标签按命中得分降序、标签升序
    pub fn classify(&self, goal_text: &str) -> Vec<String> {
        let lowered = goal_text.to_lowercase();
        let mut scores: HashMap<&'static str, usize> = HashMap::new();
        for rule in RULES {
            let score = rule
                .keywords
                .iter()
                .filter(|kw| lowered.contains(&kw.to_lowercase()))
                .count();
            if score > 0 {
                scores.insert(rule.tag, score);
            }
        }

        let mut ranked: Vec<(&str, usize)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        let mut tags = vec![CORE_TAG.to_string()];
        tags.extend(ranked.into_iter().map(|(tag, _)| tag.to_string()));
        debug!(tags = ?tags, "goal classified");
        tags
    }
}

impl Default for DomainClassifier {
    fn default() -> Self {
        Self::new()
    }
}
