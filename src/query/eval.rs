//! Query evaluation
//!
//! Straightforward graph walking over the immutable build graph; queries
//! never mutate anything. Results are ordered sets so output is stable.

use crate::graph::{BuildGraph, TargetId};
use crate::query::parser::{QueryExpr, TargetPattern};
use crate::query::QueryError;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Evaluate an expression against a graph
pub fn evaluate(graph: &BuildGraph, expr: &QueryExpr) -> Result<BTreeSet<TargetId>, QueryError> {
    match expr {
        QueryExpr::Pattern(pattern) => Ok(match_pattern(graph, pattern)),
        QueryExpr::Deps(inner, depth) => {
            let roots = evaluate(graph, inner)?;
            Ok(walk(graph, &roots, *depth, Direction::Deps))
        }
        QueryExpr::Rdeps(inner) => {
            let roots = evaluate(graph, inner)?;
            Ok(walk(graph, &roots, None, Direction::Dependents))
        }
        QueryExpr::AllPaths(from, to) => {
            let sources = evaluate(graph, from)?;
            let sinks = evaluate(graph, to)?;
            Ok(all_paths(graph, &sources, &sinks))
        }
        QueryExpr::Kind(kind, inner) => {
            let set = evaluate(graph, inner)?;
            Ok(set
                .into_iter()
                .filter(|id| {
                    graph
                        .node(id)
                        .map(|n| n.target.target_type.as_str() == kind)
                        .unwrap_or(false)
                })
                .collect())
        }
        QueryExpr::Attr(name, value, inner) => {
            let set = evaluate(graph, inner)?;
            Ok(set
                .into_iter()
                .filter(|id| {
                    graph
                        .node(id)
                        .map(|n| attr_matches(n, name, value))
                        .unwrap_or(false)
                })
                .collect())
        }
    }
}

fn attr_matches(node: &crate::graph::BuildNode, name: &str, value: &str) -> bool {
    match name {
        "language" => node.target.language.as_str() == value,
        "type" => node.target.target_type.as_str() == value,
        _ => {
            node.target.env.get(name).map(String::as_str) == Some(value)
                || node.target.flags.iter().any(|f| {
                    f.strip_prefix(name)
                        .and_then(|rest| rest.strip_prefix('='))
                        .map(|v| v == value)
                        .unwrap_or(false)
                })
        }
    }
}

fn match_pattern(graph: &BuildGraph, pattern: &TargetPattern) -> BTreeSet<TargetId> {
    graph
        .nodes()
        .filter(|node| match pattern {
            TargetPattern::All => true,
            TargetPattern::Recursive { path } => {
                let package = node.target.package();
                package == path || package.starts_with(&format!("{path}/"))
            }
            TargetPattern::Package { path } => node.target.package() == path,
            TargetPattern::Exact(id) => &node.target.id == id,
        })
        .map(|node| node.target.id.clone())
        .collect()
}

enum Direction {
    Deps,
    Dependents,
}

/// BFS from the roots along one edge direction, excluding the roots
fn walk(
    graph: &BuildGraph,
    roots: &BTreeSet<TargetId>,
    depth: Option<u32>,
    direction: Direction,
) -> BTreeSet<TargetId> {
    let mut reached = BTreeSet::new();
    let mut seen: HashSet<TargetId> = roots.iter().cloned().collect();
    let mut frontier: VecDeque<(TargetId, u32)> =
        roots.iter().map(|id| (id.clone(), 0)).collect();

    while let Some((id, at_depth)) = frontier.pop_front() {
        if let Some(limit) = depth {
            if at_depth >= limit {
                continue;
            }
        }
        let node = match graph.node(&id) {
            Some(node) => node,
            None => continue,
        };
        let next: &[TargetId] = match direction {
            Direction::Deps => &node.target.deps,
            Direction::Dependents => &node.dependents,
        };
        for neighbor in next {
            if seen.insert(neighbor.clone()) {
                reached.insert(neighbor.clone());
                frontier.push_back((neighbor.clone(), at_depth + 1));
            }
        }
    }
    reached
}

/// Every node on any dependency path from a source to a sink
///
/// DFS with an active-path stack; a node on at least one successful path
/// is included exactly once. Nodes proven unable to reach a sink are
/// memoized as dead so the walk stays linear on DAGs.
fn all_paths(
    graph: &BuildGraph,
    sources: &BTreeSet<TargetId>,
    sinks: &BTreeSet<TargetId>,
) -> BTreeSet<TargetId> {
    let sink_set: HashSet<&str> = sinks.iter().map(String::as_str).collect();
    let mut result = BTreeSet::new();
    let mut reaches: HashMap<TargetId, bool> = HashMap::new();

    fn visit(
        graph: &BuildGraph,
        id: &str,
        sink_set: &HashSet<&str>,
        reaches: &mut HashMap<TargetId, bool>,
        path: &mut Vec<TargetId>,
        result: &mut BTreeSet<TargetId>,
    ) -> bool {
        if let Some(&known) = reaches.get(id) {
            if known {
                // A known-good node completes every path currently on the
                // stack.
                for on_path in path.iter() {
                    result.insert(on_path.clone());
                }
                result.insert(id.to_string());
            }
            return known;
        }

        path.push(id.to_string());
        let mut found = sink_set.contains(id);
        if found {
            for on_path in path.iter() {
                result.insert(on_path.clone());
            }
        }

        if let Some(node) = graph.node(id) {
            for dep in &node.target.deps {
                if visit(graph, dep, sink_set, reaches, path, result) {
                    found = true;
                }
            }
        }

        path.pop();
        reaches.insert(id.to_string(), found);
        found
    }

    let mut path = Vec::new();
    for source in sources {
        visit(
            graph,
            source,
            &sink_set,
            &mut reaches,
            &mut path,
            &mut result,
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Target, TargetType};
    use crate::handler::Language;
    use crate::query::parser::parse;

    fn demo_graph() -> BuildGraph {
        BuildGraph::from_targets(vec![
            Target::new("//app:main", TargetType::Executable, Language::Rust)
                .with_deps(vec!["//lib:a".to_string(), "//lib:b".to_string()]),
            Target::new("//lib:a", TargetType::Library, Language::Rust)
                .with_deps(vec!["//base:core".to_string()]),
            Target::new("//lib:b", TargetType::Library, Language::Rust),
            Target::new("//base:core", TargetType::Library, Language::Cpp),
            Target::new("//tools/fmt:fmt", TargetType::Executable, Language::Go),
        ])
        .unwrap()
    }

    fn run(graph: &BuildGraph, query: &str) -> Vec<String> {
        evaluate(graph, &parse(query).unwrap())
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn test_pattern_all() {
        assert_eq!(run(&demo_graph(), "//...").len(), 5);
    }

    #[test]
    fn test_pattern_package_and_recursive() {
        let graph = demo_graph();
        assert_eq!(run(&graph, "//lib:*"), vec!["//lib:a", "//lib:b"]);
        assert_eq!(run(&graph, "//tools/..."), vec!["//tools/fmt:fmt"]);
        assert_eq!(run(&graph, "//app:main"), vec!["//app:main"]);
    }

    #[test]
    fn test_deps_excludes_roots() {
        let graph = demo_graph();
        assert_eq!(
            run(&graph, "deps(//app:main)"),
            vec!["//base:core", "//lib:a", "//lib:b"]
        );
    }

    #[test]
    fn test_deps_depth_limited() {
        let graph = demo_graph();
        assert_eq!(
            run(&graph, "deps(//app:main, 1)"),
            vec!["//lib:a", "//lib:b"]
        );
    }

    #[test]
    fn test_rdeps() {
        let graph = demo_graph();
        assert_eq!(run(&graph, "rdeps(//lib:a)"), vec!["//app:main"]);
        assert_eq!(
            run(&graph, "rdeps(//base:core)"),
            vec!["//app:main", "//lib:a"]
        );
    }

    #[test]
    fn test_kind_filter() {
        let graph = demo_graph();
        assert_eq!(
            run(&graph, "kind(library, //...)"),
            vec!["//base:core", "//lib:a", "//lib:b"]
        );
        assert_eq!(
            run(&graph, "kind(executable, //lib:*)"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_attr_filter() {
        let graph = demo_graph();
        assert_eq!(run(&graph, "attr(language, cpp, //...)"), vec!["//base:core"]);
        assert_eq!(
            run(&graph, "attr(language, rust, //lib:*)"),
            vec!["//lib:a", "//lib:b"]
        );
    }

    #[test]
    fn test_allpaths() {
        let graph = demo_graph();
        assert_eq!(
            run(&graph, "allpaths(//app:main, //base:core)"),
            vec!["//app:main", "//base:core", "//lib:a"]
        );
        // No path between siblings.
        assert_eq!(
            run(&graph, "allpaths(//lib:b, //base:core)"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_allpaths_diamond_includes_both_arms() {
        let graph = BuildGraph::from_targets(vec![
            Target::new("//d:top", TargetType::Library, Language::Go)
                .with_deps(vec!["//d:left".to_string(), "//d:right".to_string()]),
            Target::new("//d:left", TargetType::Library, Language::Go)
                .with_deps(vec!["//d:bottom".to_string()]),
            Target::new("//d:right", TargetType::Library, Language::Go)
                .with_deps(vec!["//d:bottom".to_string()]),
            Target::new("//d:bottom", TargetType::Library, Language::Go),
        ])
        .unwrap();

        assert_eq!(
            run(&graph, "allpaths(//d:top, //d:bottom)"),
            vec!["//d:bottom", "//d:left", "//d:right", "//d:top"]
        );
    }
}
