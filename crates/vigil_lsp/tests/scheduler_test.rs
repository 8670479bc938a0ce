mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use vigil_core::catalog::EMBEDDED_CATALOG;
use vigil_core::{Engine, EngineOptions};
use vigil_lsp::{ChangeEvent, ConfigEvent, ServerOptions, WorkspaceLintJob, workspace_config};
use vigil_types::Severity;

use common::{start_scheduler, start_scheduler_with, uri_of, wait_until, write_file};

const FOO: &str = "package foo\n\nimport data.bar\nimport data.baz\n";

fn rules(ids: &[&str]) -> Option<Vec<String>> {
    Some(ids.iter().map(|id| id.to_string()).collect())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unresolved_import_follows_package_changes() {
    let dir = tempfile::tempdir().unwrap();
    let foo = write_file(dir.path(), "foo.rego", FOO);
    let bar = write_file(dir.path(), "bar.rego", "package bar\n");
    write_file(dir.path(), "baz.rego", "package baz\n");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler
        .initialize_config(workspace_config(dir.path()).unwrap())
        .unwrap();
    assert_eq!(scheduler.load_workspace(dir.path()).await.unwrap(), 3);

    wait_until("initial publication", || sink.latest_rules(&foo) == rules(&[])).await;
    assert_eq!(scheduler.aggregate_store().len(), 3);

    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: bar.clone(),
            text: "package qux\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("unresolved import", || {
        sink.latest_rules(&foo) == rules(&["unresolved-import"])
    })
    .await;

    let diagnostics = sink.latest(&foo).unwrap();
    assert_eq!(diagnostics[0].message, "Unresolved import `data.bar`");
    assert_eq!(diagnostics[0].loc.start.line, 2);
    assert_eq!(sink.latest_rules(&bar), rules(&[]));

    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: bar.clone(),
            text: "package bar\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("import resolved again", || sink.latest_rules(&foo) == rules(&[])).await;

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_publishes_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let clean = write_file(dir.path(), "clean.rego", "package clean\n");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler.load_workspace(dir.path()).await.unwrap();
    wait_until("initial publication", || sink.count(&clean) > 0).await;
    let published = sink.count(&clean);

    scheduler
        .handle_event(ChangeEvent::Deleted { uri: clean.clone() })
        .await
        .unwrap();

    // The deletion path publishes before `handle_event` returns.
    assert!(sink.count(&clean) > published);
    assert_eq!(sink.latest(&clean), Some(vec![]));
    assert!(!scheduler.file_cache().contains(&clean));
    wait_until("aggregate removed", || {
        scheduler.aggregate_store().get(&clean).is_none()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jobs_for_deleted_file_publish_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let uri = uri_of(dir.path(), "doomed.rego");
    let sentinel = uri_of(dir.path(), "sentinel.rego");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    for i in 0..20 {
        scheduler
            .handle_event(ChangeEvent::Changed {
                uri: uri.clone(),
                text: format!("package doomed\n# TODO {}\n", i),
            })
            .await
            .unwrap();
    }
    scheduler
        .handle_event(ChangeEvent::Deleted { uri: uri.clone() })
        .await
        .unwrap();
    assert_eq!(sink.latest(&uri), Some(vec![]));

    // File jobs run in order, so every job for the deleted file is done once
    // the sentinel is published.
    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: sentinel.clone(),
            text: "package sentinel\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("sentinel published", || sink.count(&sentinel) > 0).await;

    let published = sink.count(&uri);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.count(&uri), published);
    assert_eq!(sink.latest(&uri), Some(vec![]));
    assert!(!scheduler.file_cache().contains(&uri));
    assert!(scheduler.aggregate_store().get(&uri).is_none());

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_import_target_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let foo = write_file(dir.path(), "foo.rego", FOO);
    let baz = write_file(dir.path(), "baz.rego", "package baz\n");
    write_file(dir.path(), "bar.rego", "package bar\n");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler.load_workspace(dir.path()).await.unwrap();
    wait_until("initial publication", || sink.latest_rules(&foo) == rules(&[])).await;

    scheduler
        .handle_event(ChangeEvent::Deleted { uri: baz })
        .await
        .unwrap();
    wait_until("unresolved import", || {
        sink.latest_rules(&foo) == rules(&["unresolved-import"])
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_of_edits_publishes_latest_contents() {
    let dir = tempfile::tempdir().unwrap();
    let uri = uri_of(dir.path(), "burst.rego");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler
        .handle_event(ChangeEvent::Opened {
            uri: uri.clone(),
            text: "package burst\n".to_string(),
        })
        .await
        .unwrap();

    for i in 0..30 {
        let text = format!("package burst\n# {}\n", "x".repeat(130 + i));
        scheduler
            .handle_event(ChangeEvent::Changed {
                uri: uri.clone(),
                text,
            })
            .await
            .unwrap();
    }
    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: uri.clone(),
            text: "package burst\n# TODO: final\n".to_string(),
        })
        .await
        .unwrap();

    wait_until("latest contents", || {
        sink.latest_rules(&uri) == rules(&["todo-comment"])
    })
    .await;

    // Nothing computed from older contents may arrive afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.latest_rules(&uri), rules(&["todo-comment"]));
    let state = scheduler.file_cache().get(&uri).unwrap();
    assert_eq!(state.contents, "package burst\n# TODO: final\n");
    assert_eq!(state.published_diagnostics(), sink.latest(&uri).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parse_errors_suppress_lint_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let uri = uri_of(dir.path(), "broken.rego");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler
        .handle_event(ChangeEvent::Opened {
            uri: uri.clone(),
            text: "package broken\n# TODO: fix\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("lint diagnostics", || {
        sink.latest_rules(&uri) == rules(&["todo-comment"])
    })
    .await;

    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: uri.clone(),
            text: "package broken\n# TODO: fix\nallow if {\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("parse errors", || {
        sink.latest_rules(&uri) == rules(&["parse-error"])
    })
    .await;

    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: uri.clone(),
            text: "package broken\n# TODO: fix\nallow if {\n}\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("lint diagnostics again", || {
        sink.latest_rules(&uri) == rules(&["todo-comment"])
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aggregate_pass_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let foo = write_file(dir.path(), "foo.rego", FOO);
    write_file(dir.path(), "bar.rego", "package bar\n");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler.load_workspace(dir.path()).await.unwrap();
    wait_until("unresolved import", || {
        sink.latest_rules(&foo) == rules(&["unresolved-import"])
    })
    .await;
    // Let the aggregate reports of the initial pass drain.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = scheduler.aggregate_store().snapshot();
    let diagnostics = sink.latest(&foo);
    let published = sink.count(&foo);

    scheduler
        .request_workspace_lint(WorkspaceLintJob::aggregate_report("test"))
        .await
        .unwrap();
    wait_until("aggregate report", || sink.count(&foo) > published).await;

    assert_eq!(scheduler.aggregate_store().snapshot(), snapshot);
    assert_eq!(sink.latest(&foo), diagnostics);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_moves_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let foo = write_file(dir.path(), "foo.rego", FOO);
    let bar = write_file(dir.path(), "bar.rego", "package bar\n# TODO: rename\n");
    write_file(dir.path(), "baz.rego", "package baz\n");
    let moved = uri_of(dir.path(), "lib/bar.rego");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler.load_workspace(dir.path()).await.unwrap();
    wait_until("initial publication", || {
        sink.latest_rules(&bar) == rules(&["todo-comment"])
    })
    .await;

    scheduler
        .handle_event(ChangeEvent::Renamed {
            old: bar.clone(),
            new: moved.clone(),
        })
        .await
        .unwrap();

    assert_eq!(sink.latest(&bar), Some(vec![]));
    wait_until("renamed file linted", || {
        sink.latest_rules(&moved) == rules(&["todo-comment"])
    })
    .await;
    wait_until("package still resolves", || {
        sink.latest_rules(&foo) == rules(&[])
    })
    .await;
    assert!(!scheduler.file_cache().contains(&bar));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_reload_applies_ignore_patterns() {
    let dir = tempfile::tempdir().unwrap();
    let long_line = format!("package vendored\n# {}\n", "x".repeat(150));
    let own = write_file(dir.path(), "own.rego", "package own\n");
    let vendored = write_file(dir.path(), "vendor/lib.rego", &long_line);

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler
        .initialize_config(workspace_config(dir.path()).unwrap())
        .unwrap();
    scheduler.load_workspace(dir.path()).await.unwrap();
    wait_until("vendored file linted", || {
        sink.latest_rules(&vendored) == rules(&["line-length"])
    })
    .await;

    let config = dir.path().join(".vigil.json");
    std::fs::write(&config, r#"{ "ignore": ["vendor/**"] }"#).unwrap();
    scheduler
        .handle_config_event(ConfigEvent::Changed(config.clone()))
        .await
        .unwrap();
    wait_until("vendored file ignored", || {
        sink.latest_rules(&vendored) == rules(&[])
            && scheduler.file_cache().ignored_uris().contains(&vendored)
    })
    .await;
    assert!(!scheduler.file_cache().contains(&vendored));
    assert!(scheduler.file_cache().contains(&own));

    // Edits to ignored files stay out of the lint state.
    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: vendored.clone(),
            text: format!("{}# TODO\n", long_line),
        })
        .await
        .unwrap();
    assert_eq!(sink.latest(&vendored), Some(vec![]));
    assert!(!scheduler.file_cache().contains(&vendored));

    std::fs::remove_file(&config).unwrap();
    scheduler
        .handle_config_event(ConfigEvent::Dropped)
        .await
        .unwrap();
    wait_until("vendored file linted again", || {
        sink.latest_rules(&vendored) == rules(&["line-length", "todo-comment"])
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_config_keeps_previous() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join(".vigil.json");
    std::fs::write(&config, r#"{ "ignore": ["vendor/**"] }"#).unwrap();

    let (scheduler, _sink) = start_scheduler(ServerOptions::default());
    scheduler
        .initialize_config(workspace_config(dir.path()).unwrap())
        .unwrap();

    std::fs::write(&config, r#"{ "ignore": "not-a-list" }"#).unwrap();
    scheduler
        .handle_config_event(ConfigEvent::Changed(config))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        scheduler.active_config().config.ignore,
        vec!["vendor/**".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ticker_relints_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let uri = write_file(dir.path(), "a.rego", "package a\n");

    let options = ServerOptions {
        ticker_interval: Some(Duration::from_millis(50)),
        ..ServerOptions::default()
    };
    let (scheduler, sink) = start_scheduler(options);
    scheduler.load_workspace(dir.path()).await.unwrap();

    wait_until("periodic passes", || sink.count(&uri) >= 3).await;
    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unchanged_config_is_not_reapplied() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join(".vigil.json");
    std::fs::write(&config, r#"{ "rules": { "line-length": { "max": 100 } } }"#).unwrap();
    let uri = write_file(dir.path(), "a.rego", "package a\n# TODO: tighten\n");

    let (scheduler, sink) = start_scheduler(ServerOptions::default());
    scheduler
        .initialize_config(workspace_config(dir.path()).unwrap())
        .unwrap();
    scheduler.load_workspace(dir.path()).await.unwrap();
    wait_until("initial publication", || {
        sink.latest_rules(&uri) == rules(&["todo-comment"])
    })
    .await;
    let published = sink.count(&uri);

    scheduler
        .handle_config_event(ConfigEvent::Changed(config.clone()))
        .await
        .unwrap();
    std::fs::write(
        &config,
        r#"{ "rules": { "line-length": { "max": 100 }, "todo-comment": "off" } }"#,
    )
    .unwrap();
    scheduler
        .handle_config_event(ConfigEvent::Changed(config))
        .await
        .unwrap();
    wait_until("todo-comment disabled", || sink.latest_rules(&uri) == rules(&[])).await;

    // Only the real change led to a full pass.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.count(&uri), published + 1);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hot_reloaded_catalog_reaches_enabled_rules() {
    let rules_dir = tempfile::tempdir().unwrap();
    let catalog = rules_dir.path().join("catalog.json");
    std::fs::write(&catalog, EMBEDDED_CATALOG).unwrap();
    let engine = Engine::new(EngineOptions {
        hot_reload_dir: Some(rules_dir.path().to_path_buf()),
    })
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let uri = uri_of(dir.path(), "a.rego");
    let (scheduler, sink) = start_scheduler_with(engine, ServerOptions::default());
    let severity = |sink: &common::RecordingSink| {
        sink.latest(&uri)
            .and_then(|diagnostics| diagnostics.first().map(|d| d.severity))
    };

    scheduler
        .handle_event(ChangeEvent::Opened {
            uri: uri.clone(),
            text: "package a\n# TODO: one\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("info diagnostic", || severity(sink.as_ref()) == Some(Severity::Info)).await;

    let louder = EMBEDDED_CATALOG.replace(r#""severity": "info""#, r#""severity": "warning""#);
    std::fs::write(&catalog, louder).unwrap();
    scheduler
        .handle_event(ChangeEvent::Changed {
            uri: uri.clone(),
            text: "package a\n# TODO: two\n".to_string(),
        })
        .await
        .unwrap();
    wait_until("warning diagnostic", || {
        severity(sink.as_ref()) == Some(Severity::Warning)
    })
    .await;
    assert_eq!(
        scheduler
            .active_config()
            .enabled_rules
            .get("todo-comment")
            .map(|rule| rule.severity),
        Some(Severity::Warning)
    );

    scheduler.shutdown().await;
}
