//! 任务依赖图
//!
//! 邻接表（上游 -> 依赖它的任务）+ 入度表；拓扑排序用 Kahn 算法，环检测用三色 DFS。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::workflow::types::{TaskId, TaskNode};

/// DFS 着色
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    InProgress,
    Done,
}

/// 任务依赖图
pub struct DependencyGraph {
    /// 按定义顺序排列的任务 ID
    ids: Vec<TaskId>,
    /// 任务在 ids 中的下标（拓扑排序的平局裁决）
    positions: HashMap<TaskId, usize>,
    /// 邻接表：任务 ID -> 依赖该任务的任务列表
    pub adjacency: HashMap<TaskId, Vec<TaskId>>,
    /// 入度表：任务 ID -> 上游依赖数
    pub in_degree: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    /// 创建依赖图；指向图外任务的依赖被忽略（由 FlowDefinition::validate 报告）
    pub fn new(tasks: &[TaskNode]) -> Self {
        let mut ids = Vec::with_capacity(tasks.len());
        let mut positions = HashMap::new();
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();

        for task in tasks {
            if positions.contains_key(&task.id) {
                continue;
            }
            positions.insert(task.id.clone(), ids.len());
            ids.push(task.id.clone());
            adjacency.insert(task.id.clone(), Vec::new());
            in_degree.insert(task.id.clone(), 0);
        }

        for task in tasks {
            let mut seen = HashSet::new();
            for up in &task.upstream {
                if !positions.contains_key(up) || !seen.insert(up.as_str()) {
                    continue;
                }
                adjacency.entry(up.clone()).or_default().push(task.id.clone());
                *in_degree.entry(task.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            ids,
            positions,
            adjacency,
            in_degree,
        }
    }

    /// 直接依赖该任务的下游任务
    pub fn dependents(&self, task_id: &str) -> &[TaskId] {
        self.adjacency.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 所有（直接或间接）依赖该任务的下游任务
    pub fn descendants(&self, task_id: &str) -> HashSet<TaskId> {
        let mut out = HashSet::new();
        let mut stack: Vec<&str> = vec![task_id];
        while let Some(id) = stack.pop() {
            for d in self.dependents(id) {
                if out.insert(d.clone()) {
                    stack.push(d);
                }
            }
        }
        out
    }

    /// 拓扑序；入度同时为 0 的任务按定义位置先后排列。
    /// 存在环时返回 Err（无法排入的任务）。
    pub fn topological_order(&self) -> Result<Vec<TaskId>, Vec<TaskId>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: BinaryHeap<Reverse<usize>> = self
            .ids
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .map(|id| Reverse(self.positions[id]))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(Reverse(pos)) = ready.pop() {
            let id = &self.ids[pos];
            order.push(id.clone());
            for dep in self.dependents(id) {
                if let Some(d) = in_degree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(self.positions[dep]));
                    }
                }
            }
        }

        if order.len() == self.ids.len() {
            Ok(order)
        } else {
            let placed: HashSet<&String> = order.iter().collect();
            Err(self
                .ids
                .iter()
                .filter(|id| !placed.contains(id))
                .cloned()
                .collect())
        }
    }

    /// 三色 DFS：再次遇到「进行中」的节点即为环，返回环上的节点（按遍历顺序）
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color: HashMap<&str, Color> =
            self.ids.iter().map(|id| (id.as_str(), Color::Unvisited)).collect();

        for root in &self.ids {
            if color[root.as_str()] != Color::Unvisited {
                continue;
            }
            // 显式栈：(节点, 下一个待访问的邻居下标)；path 与栈同步，便于截取环
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            let mut path: Vec<&str> = vec![root.as_str()];
            color.insert(root.as_str(), Color::InProgress);

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let neighbors = self.dependents(node);
                if top.1 < neighbors.len() {
                    let nb = neighbors[top.1].as_str();
                    top.1 += 1;
                    let seen = color[nb];
                    match seen {
                        Color::Unvisited => {
                            color.insert(nb, Color::InProgress);
                            stack.push((nb, 0));
                            path.push(nb);
                        }
                        Color::InProgress => {
                            let start = path.iter().position(|p| *p == nb).unwrap_or(0);
                            return Some(path[start..].iter().map(|s| s.to_string()).collect());
                        }
                        Color::Done => {}
                    }
                } else {
                    color.insert(node, Color::Done);
                    stack.pop();
                    path.pop();
                }
            }
        }
        None
    }
}
