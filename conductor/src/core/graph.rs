//! Arena view over the task tree.
//!
//! The persisted tree is nested (`Task::subtasks`). For scheduling we flatten it
//! into an arena indexed by id with parent/children adjacency, so lookups are
//! O(1) and traversal never recurses.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};

use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone)]
struct TaskNode {
    /// Task with `subtasks` emptied; children live in the adjacency list.
    task: Task,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    roots: Vec<usize>,
}

impl TaskGraph {
    /// Flatten a nested tree. Duplicate ids are rejected.
    pub fn from_tree(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = TaskGraph::default();
        // (task, parent) pairs, pushed in reverse so pops come out in file order.
        let mut stack: Vec<(Task, Option<usize>)> =
            tasks.into_iter().rev().map(|task| (task, None)).collect();

        while let Some((mut task, parent)) = stack.pop() {
            let subtasks = std::mem::take(&mut task.subtasks);
            let idx = graph.nodes.len();
            if graph.index.insert(task.id.clone(), idx).is_some() {
                bail!("duplicate task id '{}'", task.id);
            }
            graph.nodes.push(TaskNode {
                task,
                parent,
                children: Vec::new(),
            });
            match parent {
                Some(p) => graph.nodes[p].children.push(idx),
                None => graph.roots.push(idx),
            }
            for child in subtasks.into_iter().rev() {
                stack.push((child, Some(idx)));
            }
        }

        Ok(graph)
    }

    /// Rebuild the nested tree, preserving sibling order.
    pub fn into_tree(self) -> Vec<Task> {
        let TaskGraph { nodes, roots, .. } = self;
        let children: Vec<Vec<usize>> = nodes.iter().map(|n| n.children.clone()).collect();
        let mut slots: Vec<Option<Task>> = nodes.into_iter().map(|n| Some(n.task)).collect();

        // Post-order: attach children before their parent is moved out.
        let order = postorder(&roots, &children);
        for idx in order {
            let mut subtasks = Vec::with_capacity(children[idx].len());
            for &child in &children[idx] {
                if let Some(task) = slots[child].take() {
                    subtasks.push(task);
                }
            }
            if let Some(task) = slots[idx].as_mut() {
                task.subtasks = subtasks;
            }
        }

        roots.iter().filter_map(|&idx| slots[idx].take()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&idx| &self.nodes[idx].task)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.index.get(id).map(|&idx| &mut self.nodes[idx].task)
    }

    pub fn parent(&self, id: &str) -> Option<&Task> {
        let idx = *self.index.get(id)?;
        self.nodes[idx].parent.map(|p| &self.nodes[p].task)
    }

    pub fn children(&self, id: &str) -> Vec<&Task> {
        match self.index.get(id) {
            Some(&idx) => self.nodes[idx]
                .children
                .iter()
                .map(|&c| &self.nodes[c].task)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of ancestors above `id` (roots are depth 0).
    pub fn depth(&self, id: &str) -> Option<usize> {
        let mut idx = *self.index.get(id)?;
        let mut depth = 0;
        while let Some(parent) = self.nodes[idx].parent {
            depth += 1;
            idx = parent;
        }
        Some(depth)
    }

    /// Depth-first, pre-order traversal in file order.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            graph: self,
            stack: self.roots.iter().rev().copied().collect(),
        }
    }

    /// Ids in pre-order; handy when the caller needs to mutate while walking.
    pub fn preorder_ids(&self) -> Vec<String> {
        self.preorder().map(|task| task.id.clone()).collect()
    }

    /// True when every `depends_on` id resolves to a task that is exactly `done`.
    pub fn dependencies_done(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.get(dep)
                .is_some_and(|found| found.status == TaskStatus::Done)
        })
    }

    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.task.status).or_insert(0) += 1;
        }
        counts
    }

    /// True when `id` and all of its descendants are `done`.
    pub fn subtree_complete(&self, id: &str) -> bool {
        let Some(&start) = self.index.get(id) else {
            return false;
        };
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.task.status != TaskStatus::Done {
                return false;
            }
            stack.extend(node.children.iter().copied());
        }
        true
    }
}

pub struct Preorder<'a> {
    graph: &'a TaskGraph,
    stack: Vec<usize>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = &'a Task;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        let node = &self.graph.nodes[idx];
        self.stack.extend(node.children.iter().rev().copied());
        Some(&node.task)
    }
}

fn postorder(roots: &[usize], children: &[Vec<usize>]) -> Vec<usize> {
    let mut out = Vec::with_capacity(children.len());
    let mut stack: Vec<(usize, bool)> = roots.iter().rev().map(|&r| (r, false)).collect();
    while let Some((idx, expanded)) = stack.pop() {
        if expanded {
            out.push(idx);
            continue;
        }
        stack.push((idx, true));
        for &child in children[idx].iter().rev() {
            stack.push((child, false));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_with_subtasks};

    fn sample() -> Vec<Task> {
        vec![
            task_with_subtasks(
                "a",
                vec![task("a1"), task_with_subtasks("a2", vec![task("a2x")])],
            ),
            task("b"),
        ]
    }

    #[test]
    fn preorder_is_depth_first_in_file_order() {
        let graph = TaskGraph::from_tree(sample()).expect("graph");
        assert_eq!(graph.preorder_ids(), vec!["a", "a1", "a2", "a2x", "b"]);
        assert_eq!(graph.depth("a2x"), Some(2));
        assert_eq!(graph.parent("a2x").map(|t| t.id.as_str()), Some("a2"));
    }

    #[test]
    fn into_tree_restores_nesting() {
        let graph = TaskGraph::from_tree(sample()).expect("graph");
        assert_eq!(graph.into_tree(), sample());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = TaskGraph::from_tree(vec![task("x"), task_with_subtasks("y", vec![task("x")])])
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate task id 'x'"));
    }

    #[test]
    fn dependencies_require_exact_done() {
        let mut dep = task("dep");
        dep.status = TaskStatus::DonePendingMerge;
        let mut child = task("child");
        child.depends_on = vec!["dep".to_string()];
        let mut graph = TaskGraph::from_tree(vec![dep, child]).expect("graph");

        let child = graph.get("child").cloned().expect("child");
        assert!(!graph.dependencies_done(&child));

        graph.get_mut("dep").expect("dep").status = TaskStatus::Done;
        assert!(graph.dependencies_done(&child));
    }

    #[test]
    fn subtree_complete_checks_descendants() {
        let mut graph = TaskGraph::from_tree(sample()).expect("graph");
        for id in ["a", "a1", "a2"] {
            graph.get_mut(id).expect("task").status = TaskStatus::Done;
        }
        assert!(!graph.subtree_complete("a"));
        graph.get_mut("a2x").expect("task").status = TaskStatus::Done;
        assert!(graph.subtree_complete("a"));
        assert_eq!(graph.status_counts().get(&TaskStatus::Done), Some(&4));
    }
}
