//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；排序后仍未访问的节点即构成环。

use std::collections::{HashMap, VecDeque};

use crate::plan::types::{Subtask, SubtaskId};

/// 计划依赖图
pub struct PlanGraph {
    /// 邻接表：子任务 id -> 依赖该子任务的子任务列表
    pub adjacency: HashMap<SubtaskId, Vec<SubtaskId>>,
    /// 入度表：子任务 id -> 未满足的依赖数
    pub in_degree: HashMap<SubtaskId, usize>,
}

impl PlanGraph {
    /// 从子任务表构建依赖图；指向未知 id 的边被忽略（分解器已拒绝这类提案）
    pub fn new(subtasks: &HashMap<SubtaskId, Subtask>) -> Self {
        let mut adjacency: HashMap<SubtaskId, Vec<SubtaskId>> = HashMap::new();
        let mut in_degree: HashMap<SubtaskId, usize> = HashMap::new();

        for id in subtasks.keys() {
            adjacency.insert(id.clone(), Vec::new());
            in_degree.insert(id.clone(), 0);
        }

        for (id, task) in subtasks {
            for dep in &task.depends_on {
                if !subtasks.contains_key(dep) {
                    continue;
                }
                adjacency.entry(dep.clone()).or_default().push(id.clone());
                *in_degree.entry(id.clone()).or_insert(0) += 1;
            }
        }

        Self { adjacency, in_degree }
    }

    /// Kahn 拓扑排序：成功返回一个合法执行序；失败返回仍在环上的节点集（升序）
    pub fn topological_sort(&self) -> Result<Vec<SubtaskId>, Vec<SubtaskId>> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<SubtaskId> = {
            let mut roots: Vec<SubtaskId> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| id.clone())
                .collect();
            roots.sort();
            roots.into()
        };

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(dependents) = self.adjacency.get(&id) {
                for dep in dependents {
                    if let Some(d) = in_degree.get_mut(dep) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dep.clone());
                        }
                    }
                }
            }
        }

        if order.len() == in_degree.len() {
            Ok(order)
        } else {
            let mut cyclic: Vec<SubtaskId> = in_degree
                .keys()
                .filter(|id| !order.contains(id))
                .cloned()
                .collect();
            cyclic.sort();
            Err(cyclic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::Subtask;

    fn table(tasks: Vec<Subtask>) -> HashMap<SubtaskId, Subtask> {
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
    }

    #[test]
    fn test_linear_chain_topological_order() {
        let tasks = table(vec![
            Subtask::new("a", "first"),
            Subtask::new("b", "second").with_depends_on(["a"]),
            Subtask::new("c", "third").with_depends_on(["b"]),
        ]);
        let graph = PlanGraph::new(&tasks);
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_diamond_has_valid_order() {
        let tasks = table(vec![
            Subtask::new("a", "root"),
            Subtask::new("b", "left").with_depends_on(["a"]),
            Subtask::new("c", "right").with_depends_on(["a"]),
            Subtask::new("d", "join").with_depends_on(["b", "c"]),
        ]);
        let graph = PlanGraph::new(&tasks);
        let order = graph.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_cycle_names_offending_nodes() {
        let tasks = table(vec![
            Subtask::new("a", "ok"),
            Subtask::new("b", "cycles").with_depends_on(["c"]),
            Subtask::new("c", "cycles").with_depends_on(["b"]),
        ]);
        let graph = PlanGraph::new(&tasks);
        let cyclic = graph.topological_sort().unwrap_err();
        assert_eq!(cyclic, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let tasks = table(vec![Subtask::new("a", "self").with_depends_on(["a"])]);
        let graph = PlanGraph::new(&tasks);
        let cyclic = graph.topological_sort().unwrap_err();
        assert_eq!(cyclic, vec!["a".to_string()]);
    }
}
