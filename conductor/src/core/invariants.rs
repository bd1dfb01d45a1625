//! Semantic invariants not expressible via JSON Schema.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::task::Task;

/// Check semantic invariants across the whole tree:
/// - No empty or duplicate task ids, no duplicate step ids within a task
/// - Every `depends_on` id exists, no self-dependencies, no dependency cycles
/// - Within one repository, no branch name is a path prefix of another
///   (`foo` and `foo/bar` cannot coexist as git refs)
pub fn validate_invariants(tasks: &[Task]) -> Vec<String> {
    let flat = flatten(tasks);
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for (path, task) in &flat {
        if task.id.trim().is_empty() {
            errors.push(format!("{path}: id must not be empty"));
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate id '{}' at {path}", task.id));
        }
        let mut step_ids = HashSet::new();
        for step in &task.steps {
            if !step_ids.insert(step.id.as_str()) {
                errors.push(format!("{path}: duplicate step id '{}'", step.id));
            }
        }
    }

    for (path, task) in &flat {
        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(format!("{path}: task depends on itself"));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("{path}: unknown dependency '{dep}'"));
            }
        }
    }

    if let Some(cycle) = find_cycle(&flat) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors.extend(branch_prefix_conflicts(&flat));
    errors
}

/// Pre-order `(path, task)` pairs, walked with an explicit stack.
fn flatten(tasks: &[Task]) -> Vec<(String, &Task)> {
    let mut out = Vec::new();
    let mut stack: Vec<(String, &Task)> = tasks
        .iter()
        .rev()
        .map(|task| (task.id.clone(), task))
        .collect();
    while let Some((path, task)) = stack.pop() {
        for child in task.subtasks.iter().rev() {
            stack.push((format!("{path}/{}", child.id), child));
        }
        out.push((path, task));
    }
    out
}

fn branch_prefix_conflicts(flat: &[(String, &Task)]) -> Vec<String> {
    // repo -> branch -> first task path that mentions it
    let mut by_repo: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    for (path, task) in flat {
        let Some(repo) = task.repo.as_deref() else {
            continue;
        };
        let branches = by_repo.entry(repo).or_default();
        for name in [
            task.branch.as_deref(),
            task.merge_into.as_deref(),
            task.base_branch.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            branches.entry(name).or_insert(path.as_str());
        }
    }

    let mut errors = Vec::new();
    for (repo, branches) in &by_repo {
        // Sorted order puts `foo` right before `foo/...`, but `foo-x` can sit
        // between them, so compare each name against every later one sharing the prefix.
        let names: Vec<(&str, &str)> = branches.iter().map(|(b, p)| (*b, *p)).collect();
        for (i, (short, short_path)) in names.iter().enumerate() {
            let prefix = format!("{short}/");
            for (long, long_path) in &names[i + 1..] {
                if !long.starts_with(short) {
                    break;
                }
                if long.starts_with(&prefix) {
                    errors.push(format!(
                        "repo '{repo}': branch '{short}' ({short_path}) is a path prefix of '{long}' ({long_path})"
                    ));
                }
            }
        }
    }
    errors
}

fn find_cycle(flat: &[(String, &Task)]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = flat
        .iter()
        .map(|(_, task)| (task.id.as_str(), task.depends_on.as_slice()))
        .collect();

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let roots: BTreeSet<&str> = deps.keys().copied().collect();
    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        // (node, next dependency index); `path` mirrors the stack for reporting.
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        let mut path: Vec<&str> = vec![root];
        marks.insert(root, Mark::Visiting);
        while let Some((node, next)) = stack.last_mut() {
            let node_deps = deps.get(*node).copied().unwrap_or_default();
            if *next >= node_deps.len() {
                marks.insert(*node, Mark::Done);
                stack.pop();
                path.pop();
                continue;
            }
            let dep = node_deps[*next].as_str();
            *next += 1;
            if !deps.contains_key(dep) {
                continue;
            }
            match marks.get(dep) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|p| p.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                None => {
                    marks.insert(dep, Mark::Visiting);
                    stack.push((dep, 0));
                    path.push(dep);
                }
            }
        }
    }
    None
}
