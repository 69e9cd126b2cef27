//! Kernel module load ordering.
//!
//! Each module declares the modules it depends on (`modinfo -F depends`).
//! The guest init loads modules in file-name order, so the builder needs a
//! sequence in which every module comes after the modules it depends on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::kmod::canonical_name;
use crate::process::Cmd;

/// Source of a module's declared dependency names.
///
/// A query that cannot answer returns an empty list; a module with unknown
/// dependencies is still placed, just without ordering constraints.
pub trait DependencyQuery {
    fn dependencies(&self, module: &Path) -> Vec<String>;
}

impl<F> DependencyQuery for F
where
    F: Fn(&Path) -> Vec<String>,
{
    fn dependencies(&self, module: &Path) -> Vec<String> {
        self(module)
    }
}

/// Reads dependencies with `modinfo -F depends`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Modinfo;

impl DependencyQuery for Modinfo {
    fn dependencies(&self, module: &Path) -> Vec<String> {
        let result = Cmd::new("modinfo")
            .args(["-F", "depends"])
            .arg_path(module)
            .run();

        match result {
            Ok(out) => parse_depends(out.stdout_trimmed()),
            Err(e) => {
                tracing::debug!("modinfo failed for {}: {:#}", module.display(), e);
                Vec::new()
            }
        }
    }
}

/// Parse the comma-separated `depends` field.
pub fn parse_depends(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

struct Node<'a> {
    path: &'a Path,
    deps: Vec<String>,
}

/// Order `modules` so that each one follows its present dependencies.
///
/// Depth-first over the dependency relation with an explicit stack. Names
/// that don't match any input module are ignored. A dependency that points
/// back at a module still in progress is skipped, so cycles terminate;
/// ordering inside a cycle is best-effort. If two inputs share a canonical
/// name, both are emitted and dependency names resolve to the first one.
pub fn resolve_load_order(modules: &[PathBuf], query: &dyn DependencyQuery) -> Vec<PathBuf> {
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut nodes = Vec::with_capacity(modules.len());

    for (idx, path) in modules.iter().enumerate() {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        by_name
            .entry(canonical_name(&file_name).to_string())
            .or_insert(idx);
        nodes.push(Node {
            path,
            deps: query.dependencies(path),
        });
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    for root in 0..nodes.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        // (node, index of the next dependency to look at)
        let mut stack = vec![(root, 0usize)];

        while let Some(&(idx, next)) = stack.last() {
            let Some(dep) = nodes[idx].deps.get(next) else {
                stack.pop();
                marks[idx] = Mark::Done;
                order.push(nodes[idx].path.to_path_buf());
                continue;
            };

            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match by_name.get(dep.as_str()) {
                Some(&d) if marks[d] == Mark::Unvisited => {
                    marks[d] = Mark::InProgress;
                    stack.push((d, 0));
                }
                Some(&d) if marks[d] == Mark::InProgress => {
                    tracing::warn!(
                        "Dependency cycle: {} -> {}, ignoring back edge",
                        nodes[idx].path.display(),
                        nodes[d].path.display()
                    );
                }
                // Done, or not part of this build
                _ => {}
            }
        }
    }

    order
}
