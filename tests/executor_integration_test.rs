// Integration tests for the build executor: clean builds, cache
// invalidation, cascading failure, and checkpointed resume.

use forge::cache::{TargetCache, TargetCacheConfig};
use forge::checkpoint::{CheckpointConfig, CheckpointManager};
use forge::error::{BuildError, BuildResult};
use forge::events::{BuildEvent, EventBus};
use forge::executor::{Executor, ExecutorConfig};
use forge::graph::{BuildGraph, BuildStatus, Target, TargetType};
use forge::handler::{Language, LanguageHandler, HandlerRegistry};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Handler double: hashes real source contents so rebuilds propagate, and
/// records every invocation.
struct RecordingHandler {
    language: Language,
    calls: Arc<Mutex<Vec<String>>>,
    failures: HashSet<String>,
}

impl RecordingHandler {
    fn new(language: Language) -> (Self, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                language,
                calls: calls.clone(),
                failures: HashSet::new(),
            },
            calls,
        )
    }

    fn failing_on(mut self, target_id: &str) -> Self {
        self.failures.insert(target_id.to_string());
        self
    }
}

impl LanguageHandler for RecordingHandler {
    fn language(&self) -> Language {
        self.language
    }

    fn build(&self, target: &Target, workspace: &Path) -> BuildResult<String> {
        self.calls.lock().push(target.id.clone());
        if self.failures.contains(&target.id) {
            return Err(BuildError::CompileFailure {
                target_id: target.id.clone(),
                stderr: "induced failure".to_string(),
            });
        }
        let mut pieces = vec![target.id.clone()];
        for source in &target.sources {
            pieces.push(forge::hash::hash_file(&workspace.join(source)));
        }
        Ok(forge::hash::hash_strings(&pieces))
    }
}

/// Honor RUST_LOG in test runs; repeated calls are fine.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn write_source(workspace: &Path, rel: &str, contents: &[u8]) {
    let path = workspace.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(contents).unwrap();
    file.sync_all().unwrap();
}

fn c_target(id: &str, sources: &[&str], deps: &[&str]) -> Target {
    Target::new(id, TargetType::Library, Language::Cpp)
        .with_sources(sources.iter().map(PathBuf::from).collect())
        .with_deps(deps.iter().map(|d| d.to_string()).collect())
}

fn executor_for(
    workspace: &Path,
    handler: RecordingHandler,
    config: ExecutorConfig,
) -> (Executor, Arc<TargetCache>) {
    let cache = Arc::new(TargetCache::open(workspace, TargetCacheConfig::default()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(handler));
    let executor =
        Executor::new(workspace, cache.clone(), Arc::new(handlers)).with_config(config);
    (executor, cache)
}

fn two_node_graph() -> BuildGraph {
    BuildGraph::from_targets(vec![
        c_target("//pkg:a", &["a.c"], &[]),
        c_target("//pkg:b", &["b.c"], &["//pkg:a"]),
    ])
    .unwrap()
}

#[test]
fn test_clean_build_then_fully_cached_rebuild() -> anyhow::Result<()> {
    init_logging();
    let dir = TempDir::new()?;
    write_source(dir.path(), "a.c", b"int a;");
    write_source(dir.path(), "b.c", b"int b;");

    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    // First run builds everything.
    let mut graph = two_node_graph();
    let summary = executor.execute(&mut graph)?;
    assert!(summary.succeeded());
    assert_eq!(summary.stats.built, 2);
    assert_eq!(summary.stats.cached, 0);
    assert_eq!(calls.lock().len(), 2);
    for id in ["//pkg:a", "//pkg:b"] {
        assert_eq!(graph.node(id).unwrap().status, BuildStatus::Success);
        assert!(!graph.node(id).unwrap().output_hash.is_empty());
    }

    // Second run with identical files touches no handler.
    calls.lock().clear();
    let mut graph = two_node_graph();
    let summary = executor.execute(&mut graph)?;
    assert_eq!(summary.stats.cached, 2);
    assert_eq!(summary.stats.built, 0);
    assert!(calls.lock().is_empty(), "no handler on a warm cache");
    for id in ["//pkg:a", "//pkg:b"] {
        assert_eq!(graph.node(id).unwrap().status, BuildStatus::Cached);
    }
    Ok(())
}

#[test]
fn test_source_change_rebuilds_transitive_dependents() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), "a.c", b"int a;");
    write_source(dir.path(), "b.c", b"int b;");

    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    let mut graph = two_node_graph();
    executor.execute(&mut graph).unwrap();

    // Overwrite a.c: A rebuilds on content, B rebuilds on dep hash.
    write_source(dir.path(), "a.c", b"int a_rewritten;");
    calls.lock().clear();
    let mut graph = two_node_graph();
    let summary = executor.execute(&mut graph).unwrap();
    assert_eq!(summary.stats.built, 2);
    assert_eq!(summary.stats.cached, 0);
}

#[test]
fn test_independent_sibling_stays_cached() {
    let dir = TempDir::new().unwrap();
    for name in ["base.c", "mid1.c", "mid2.c", "top.c"] {
        write_source(dir.path(), name, format!("// {name}").as_bytes());
    }

    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    let diamond = || {
        BuildGraph::from_targets(vec![
            c_target("//d:base", &["base.c"], &[]),
            c_target("//d:mid1", &["mid1.c"], &["//d:base"]),
            c_target("//d:mid2", &["mid2.c"], &["//d:base"]),
            c_target("//d:top", &["top.c"], &["//d:mid1", "//d:mid2"]),
        ])
        .unwrap()
    };

    let mut graph = diamond();
    executor.execute(&mut graph).unwrap();

    // Toggle one source of mid1: exactly mid1 and top rebuild.
    write_source(dir.path(), "mid1.c", b"// mid1 changed");
    calls.lock().clear();
    let mut graph = diamond();
    let summary = executor.execute(&mut graph).unwrap();

    let rebuilt: HashSet<String> = calls.lock().iter().cloned().collect();
    assert_eq!(
        rebuilt,
        HashSet::from(["//d:mid1".to_string(), "//d:top".to_string()])
    );
    assert_eq!(summary.stats.built, 2);
    assert_eq!(summary.stats.cached, 2);
    assert_eq!(graph.node("//d:mid2").unwrap().status, BuildStatus::Cached);
}

#[test]
fn test_cascading_failure_never_invokes_dependents() {
    let dir = TempDir::new().unwrap();
    for name in ["a.c", "b.c", "c.c"] {
        write_source(dir.path(), name, format!("// {name}").as_bytes());
    }

    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let handler = handler.failing_on("//pkg:b");
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    let mut graph = BuildGraph::from_targets(vec![
        c_target("//pkg:a", &["a.c"], &[]),
        c_target("//pkg:b", &["b.c"], &["//pkg:a"]),
        c_target("//pkg:c", &["c.c"], &["//pkg:b"]),
    ])
    .unwrap();

    let summary = executor.execute(&mut graph).unwrap();
    assert!(!summary.succeeded());
    assert_eq!(summary.stats.failed, 2, "B failed, C cascaded");
    assert_eq!(
        summary.failed_targets,
        vec!["//pkg:b".to_string(), "//pkg:c".to_string()]
    );

    assert_eq!(graph.node("//pkg:a").unwrap().status, BuildStatus::Success);
    assert_eq!(graph.node("//pkg:b").unwrap().status, BuildStatus::Failed);
    assert_eq!(graph.node("//pkg:c").unwrap().status, BuildStatus::Failed);
    assert!(
        !calls.lock().contains(&"//pkg:c".to_string()),
        "cascaded target's handler must never run"
    );
    assert!(matches!(
        graph.node("//pkg:c").unwrap().last_error,
        Some(BuildError::DependencyFailed { .. })
    ));
}

#[test]
fn test_every_node_completes_exactly_once_on_wide_graph() {
    let dir = TempDir::new().unwrap();
    let mut targets = Vec::new();
    for layer in 0..4 {
        for i in 0..8 {
            let name = format!("l{layer}i{i}.c");
            write_source(dir.path(), &name, name.as_bytes());
            let deps: Vec<String> = if layer == 0 {
                Vec::new()
            } else {
                (0..8).map(|d| format!("//wide:l{}i{d}", layer - 1)).collect()
            };
            targets.push(
                Target::new(
                    format!("//wide:l{layer}i{i}"),
                    TargetType::Library,
                    Language::Cpp,
                )
                .with_sources(vec![PathBuf::from(name)])
                .with_deps(deps),
            );
        }
    }

    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    let mut graph = BuildGraph::from_targets(targets).unwrap();
    let summary = executor.execute(&mut graph).unwrap();

    assert!(summary.succeeded());
    assert_eq!(summary.stats.built, 32);
    assert!(graph.nodes().all(|n| n.status == BuildStatus::Success));

    let invocations = calls.lock();
    let unique: HashSet<&String> = invocations.iter().collect();
    assert_eq!(invocations.len(), 32, "each handler ran exactly once");
    assert_eq!(unique.len(), 32);
}

#[test]
fn test_work_stealing_mode_builds_everything() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), "a.c", b"int a;");
    write_source(dir.path(), "b.c", b"int b;");

    let (handler, _calls) = RecordingHandler::new(Language::Cpp);
    let config = ExecutorConfig {
        work_stealing: true,
        parallelism: Some(4),
        ..ExecutorConfig::default()
    };
    let (executor, _cache) = executor_for(dir.path(), handler, config);

    let mut graph = two_node_graph();
    let summary = executor.execute(&mut graph).unwrap();
    assert!(summary.succeeded());
    assert_eq!(summary.stats.built, 2);
}

#[test]
fn test_missing_handler_fails_target_without_aborting_build() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), "a.c", b"int a;");
    write_source(dir.path(), "z.zig", b"const a = 1;");

    let (handler, _calls) = RecordingHandler::new(Language::Cpp);
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    let mut graph = BuildGraph::from_targets(vec![
        c_target("//pkg:a", &["a.c"], &[]),
        Target::new("//pkg:z", TargetType::Library, Language::Zig)
            .with_sources(vec![PathBuf::from("z.zig")]),
    ])
    .unwrap();

    let summary = executor.execute(&mut graph).unwrap();
    assert_eq!(summary.stats.built, 1);
    assert_eq!(summary.stats.failed, 1);
    assert!(matches!(
        graph.node("//pkg:z").unwrap().last_error,
        Some(BuildError::HandlerNotFound { .. })
    ));
}

#[test]
fn test_cycle_fails_fast() {
    let dir = TempDir::new().unwrap();
    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let (executor, _cache) = executor_for(dir.path(), handler, ExecutorConfig::default());

    let mut graph = BuildGraph::new();
    graph
        .add_target(c_target("//pkg:a", &[], &["//pkg:b"]))
        .unwrap();
    graph
        .add_target(c_target("//pkg:b", &[], &["//pkg:a"]))
        .unwrap();

    let result = executor.execute(&mut graph);
    assert!(matches!(result, Err(BuildError::Cycle { .. })));
    assert!(calls.lock().is_empty());
}

#[test]
fn test_checkpoint_resume_schedules_only_remaining_targets() {
    let dir = TempDir::new().unwrap();
    let total = 40usize;
    let adopted = 20usize;

    let chain_targets = |dir: &Path| {
        let mut targets = Vec::new();
        for i in 0..total {
            let name = format!("t{i}.c");
            write_source(dir, &name, name.as_bytes());
            let deps = if i == 0 {
                Vec::new()
            } else {
                vec![format!("//chain:t{}", i - 1)]
            };
            targets.push(
                Target::new(format!("//chain:t{i}"), TargetType::Library, Language::Cpp)
                    .with_sources(vec![PathBuf::from(name)])
                    .with_deps(deps),
            );
        }
        targets
    };

    // A prior run got through the first half before dying.
    let manager = CheckpointManager::new(dir.path(), CheckpointConfig::default());
    let mut prior = BuildGraph::from_targets(chain_targets(dir.path())).unwrap();
    for i in 0..adopted {
        prior
            .node_mut(&format!("//chain:t{i}"))
            .unwrap()
            .mark_success(format!("hash-{i}"));
    }
    manager.save_now(&prior).unwrap();

    let (handler, calls) = RecordingHandler::new(Language::Cpp);
    let cache = Arc::new(TargetCache::open(dir.path(), TargetCacheConfig::default()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(handler));
    let executor = Executor::new(dir.path(), cache, Arc::new(handlers))
        .with_checkpoints(CheckpointManager::new(dir.path(), CheckpointConfig::default()));

    let mut graph = BuildGraph::from_targets(chain_targets(dir.path())).unwrap();
    let summary = executor.execute(&mut graph).unwrap();

    assert!(summary.succeeded());
    assert_eq!(
        calls.lock().len(),
        total - adopted,
        "only the unfinished half is scheduled"
    );
    assert_eq!(summary.stats.built, total - adopted);
    assert!(graph.nodes().all(|n| n.status.is_complete()));

    // A clean finish removes the checkpoint.
    assert!(!manager.path().exists());
}

#[test]
fn test_event_stream_orders_per_target() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), "a.c", b"int a;");

    let (handler, _calls) = RecordingHandler::new(Language::Cpp);
    let cache = Arc::new(TargetCache::open(dir.path(), TargetCacheConfig::default()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(handler));

    let events = EventBus::shared();
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        events.subscribe(move |event| {
            log.lock().push(match event {
                BuildEvent::BuildStarted { .. } => "build_started",
                BuildEvent::TargetStarted { .. } => "target_started",
                BuildEvent::TargetCompleted { .. } => "target_completed",
                BuildEvent::TargetProgress { .. } => "progress",
                BuildEvent::Statistics { .. } => "statistics",
                BuildEvent::BuildCompleted { .. } => "build_completed",
                _ => "other",
            });
        });
    }

    let executor = Executor::new(dir.path(), cache, Arc::new(handlers)).with_events(events);
    let mut graph =
        BuildGraph::from_targets(vec![c_target("//pkg:a", &["a.c"], &[])]).unwrap();
    executor.execute(&mut graph).unwrap();

    let log = log.lock();
    let position = |tag: &str| log.iter().position(|l| *l == tag).unwrap();
    assert_eq!(position("build_started"), 0);
    assert!(position("target_started") < position("target_completed"));
    assert!(position("statistics") < position("build_completed"));
}
