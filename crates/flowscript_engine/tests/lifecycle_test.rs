//! Lifecycle controller behaviour: caching, hook ordering, failure handling
//! and teardown, driven through a recording host.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use common::{RecordingHost, eventually, node_for, node_with};
use flowscript_engine::{
    EngineConfig, LifecycleState, ModuleExport, Outputs, ScriptDefinition, ScriptError, ScriptNode,
    ScriptNodeRegistry, StaticModuleResolver,
};

fn appending(label: &str) -> String {
    format!("flow.set('log', (flow.get('log') || []).concat(['{}']));", label)
}

#[tokio::test]
async fn test_returns_message_unchanged() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("return msg;").with_version(1);

    let outputs = node.execute(&def, json!({ "payload": 5, "topic": "t" })).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!({ "payload": 5, "topic": "t" })));
    assert_eq!(node.state(), LifecycleState::Ready);
    node.close().await;
}

#[tokio::test]
async fn test_typescript_body() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "interface Reading { value: number }\n\
         const r = msg.payload as Reading;\n\
         return { payload: r.value * 2 };",
    );

    let outputs = node.execute(&def, json!({ "payload": { "value": 21 } })).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!({ "payload": 42 })));
    node.close().await;
}

#[tokio::test]
async fn test_cache_hit_reuses_artifact() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("return msg;")
        .with_initialize(appending("init"))
        .with_version(1);

    let first = node.get_compilation(&def).await.unwrap();
    let second = node.get_compilation(&def).await.unwrap();
    node.execute(&def, json!({})).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(host.stores().flow.get("log"), Some(json!(["init"])));
    node.close().await;
}

#[tokio::test]
async fn test_recompile_finalizes_before_initialize() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());

    let v1 = ScriptDefinition::new("return msg;")
        .with_initialize(appending("init1"))
        .with_finalize(appending("fin1"))
        .with_version(1);
    let v2 = ScriptDefinition::new("return msg;")
        .with_initialize(appending("init2"))
        .with_finalize(appending("fin2"))
        .with_version(2);

    let old = node.get_compilation(&v1).await.unwrap();
    node.get_compilation(&v2).await.unwrap();

    assert_eq!(host.stores().flow.get("log"), Some(json!(["init1", "fin1", "init2"])));
    assert!(old.is_shut_down());

    node.close().await;
    assert_eq!(
        host.stores().flow.get("log"),
        Some(json!(["init1", "fin1", "init2", "fin2"]))
    );
}

#[tokio::test]
async fn test_throwing_finalize_does_not_block_recompile() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());

    let v1 = ScriptDefinition::new("return 1;")
        .with_finalize("throw new Error('cleanup broke');")
        .with_version(1);
    let v2 = ScriptDefinition::new("return 2;").with_version(2);

    node.get_compilation(&v1).await.unwrap();
    let outputs = node.execute(&v2, json!({})).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!(2)));
    assert!(host.errors().iter().any(|e| e.contains("cleanup broke")));
    node.close().await;
}

#[tokio::test]
async fn test_strategy_change_recompiles() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let direct = ScriptDefinition::new("return 1;").with_version(1);
    let isolated = direct.clone().isolated(None);

    let a = node.get_compilation(&direct).await.unwrap();
    let b = node.get_compilation(&isolated).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(b.strategy().is_isolated());
    assert!(b.generation() > a.generation());
    node.close().await;
}

#[tokio::test]
async fn test_initialize_failure_keeps_artifact() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("return 'ok';")
        .with_initialize("throw new Error('init broke');")
        .with_version(1);

    let outputs = node.execute(&def, json!({})).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!("ok")));
    assert!(host.errors().iter().any(|e| e.starts_with("Initialize failed") && e.contains("init broke")));

    // Not retried on the next input
    node.execute(&def, json!({})).await.unwrap();
    assert_eq!(host.errors().len(), 1);
    node.close().await;
}

#[tokio::test]
async fn test_execution_error_leaves_node_usable() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "if (msg.fail) { const e = new Error('bad input'); e.code = 'E_BAD'; throw e; }\nreturn msg;",
    );

    let err = assert_err!(node.execute(&def, json!({ "fail": true })).await);
    match &err {
        ScriptError::Execution(detail) => {
            assert_eq!(detail.message, "bad input");
            assert_eq!(detail.properties.get("code"), Some(&json!("E_BAD")));
        }
        other => panic!("expected an execution error, got {:?}", other),
    }

    let outputs = assert_ok!(node.execute(&def, json!({ "fail": false })).await);
    assert_eq!(outputs, Outputs::Single(json!({ "fail": false })));
    assert_eq!(node.state(), LifecycleState::Ready);
    node.close().await;
}

#[tokio::test]
async fn test_handle_input_reports_instead_of_returning() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("if (msg.fail) throw new Error('nope');\nreturn [msg, null];");

    node.handle_input(&def, json!({ "fail": true })).await;
    node.handle_input(&def, json!({ "fail": false })).await;

    assert_eq!(host.errors(), vec!["Execution failed: nope".to_string()]);
    assert_eq!(host.sent().len(), 1);
    node.close().await;
}

#[tokio::test]
async fn test_empty_script() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());

    let err = node.execute(&ScriptDefinition::new("  \n\t"), json!({})).await.unwrap_err();

    assert!(matches!(err, ScriptError::EmptyScript));
    assert_eq!(node.state(), LifecycleState::Empty);
    node.close().await;
}

#[tokio::test]
async fn test_syntax_error_keeps_previous_artifact() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let good = ScriptDefinition::new("return 'good';").with_version(1);
    let broken = ScriptDefinition::new("return {{;").with_version(2);

    let current = node.get_compilation(&good).await.unwrap();
    let err = node.execute(&broken, json!({})).await.unwrap_err();

    assert!(matches!(err, ScriptError::Compilation(_)));
    assert_eq!(node.state(), LifecycleState::Ready);
    let still = node.current().await.unwrap();
    assert!(Arc::ptr_eq(&current, &still));
    assert!(!still.is_shut_down());

    // The failure is remembered for the same version
    let again = node.execute(&broken, json!({})).await.unwrap_err();
    assert!(matches!(again, ScriptError::Compilation(_)));

    // An edit retries
    let fixed = ScriptDefinition::new("return 'fixed';").with_version(3);
    assert_eq!(node.execute(&fixed, json!({})).await.unwrap(), Outputs::Single(json!("fixed")));
    node.close().await;
}

#[tokio::test]
async fn test_reserved_and_duplicate_bindings_skip_resolution() {
    let host = RecordingHost::new("n1").shared();
    let resolver = Arc::new(StaticModuleResolver::new().with_module("m", ModuleExport::Json(json!(1))));
    let node = node_with(host.clone(), resolver.clone());

    let reserved = ScriptDefinition::new("return 1;").with_module("msg", "m").with_version(1);
    let err = node.execute(&reserved, json!({})).await.unwrap_err();
    assert!(matches!(err, ScriptError::ReservedName { ref name } if name == "msg"));

    let duplicate = ScriptDefinition::new("return 1;")
        .with_module("m1", "m")
        .with_module("m1", "m")
        .with_version(2);
    let err = node.execute(&duplicate, json!({})).await.unwrap_err();
    assert!(matches!(err, ScriptError::DuplicateBinding { ref name } if name == "m1"));

    let invalid = ScriptDefinition::new("return 1;").with_module("not-valid", "m").with_version(3);
    let err = node.execute(&invalid, json!({})).await.unwrap_err();
    assert!(matches!(err, ScriptError::InvalidBindingName { .. }));

    assert_eq!(resolver.resolve_count(), 0);
    node.close().await;
}

#[tokio::test]
async fn test_module_load_failure() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("return leftPad;").with_module("leftPad", "left-pad");

    let err = node.execute(&def, json!({})).await.unwrap_err();

    assert!(matches!(err, ScriptError::ModuleLoad { ref module, .. } if module == "left-pad"));
    assert!(host.errors().iter().any(|e| e.contains("left-pad")));
    assert!(node.current().await.is_none());
    node.close().await;
}

#[tokio::test]
async fn test_modules_are_bound_by_name() {
    let host = RecordingHost::new("n1").shared();
    let resolver = StaticModuleResolver::new()
        .with_module("consts", ModuleExport::Json(json!({ "default": { "pi": 3.5 } })))
        .with_module(
            "math",
            ModuleExport::Script("module.exports = { default: { double: (x) => x * 2 } };".into()),
        );
    let node = node_with(host.clone(), Arc::new(resolver));
    let def = ScriptDefinition::new("return { pi: consts.pi, four: math.double(2) };")
        .with_module("consts", "consts")
        .with_module("math", "math");

    let outputs = node.execute(&def, json!({})).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!({ "pi": 3.5, "four": 4 })));
    node.close().await;
}

#[tokio::test]
async fn test_stores_are_rebound_per_call() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "const n = (context.get('n') || 0) + 1;\n\
         context.set('n', n);\n\
         global.set('seen', true);\n\
         return { payload: n };",
    );

    node.execute(&def, json!({})).await.unwrap();
    let outputs = node.execute(&def, json!({})).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!({ "payload": 2 })));
    assert_eq!(host.stores().node.get("n"), Some(json!(2)));
    assert_eq!(host.stores().global.get("seen"), Some(json!(true)));
    node.close().await;
}

#[tokio::test]
async fn test_node_send_and_ports() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "node.send({ payload: 'early' });\n\
         node.log('sent', 1);\n\
         return [null, [{ payload: 'a' }, { payload: 'b' }]];",
    );

    let outputs = node.execute(&def, json!({})).await.unwrap();

    assert_eq!(
        outputs.into_messages(),
        vec![(1, json!({ "payload": "a" })), (1, json!({ "payload": "b" }))]
    );
    assert_eq!(host.sent(), vec![Outputs::Single(json!({ "payload": "early" }))]);
    assert!(host.logs().contains(&"sent 1".to_string()));
    node.close().await;
}

#[tokio::test]
async fn test_timeout_fires_and_leaves_registry() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "setTimeout(() => { node.send({ payload: 'later' }); }, 20);\nreturn null;",
    );

    node.execute(&def, json!({})).await.unwrap();
    assert_eq!(node.timers().len(), 1);

    assert!(eventually(Duration::from_secs(2), || host.sent().len() == 1).await);
    assert!(node.timers().is_empty());
    node.close().await;
}

#[tokio::test]
async fn test_clear_timeout_cancels() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "const id = setTimeout(() => node.send({ payload: 'never' }), 20);\n\
         clearTimeout(id);\n\
         clearTimeout(9999);\n\
         return null;",
    );

    node.execute(&def, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(node.timers().is_empty());
    assert!(host.sent().is_empty());
    node.close().await;
}

#[tokio::test]
async fn test_timer_callback_error_is_reported() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("setTimeout(() => { throw new Error('tick'); }, 10);\nreturn null;");

    node.execute(&def, json!({})).await.unwrap();

    assert!(
        eventually(Duration::from_secs(2), || {
            host.errors().iter().any(|e| e.starts_with("Error in timer callback") && e.contains("tick"))
        })
        .await
    );
    node.close().await;
}

#[tokio::test]
async fn test_interval_cancelled_on_recompile() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let v1 = ScriptDefinition::new("setInterval(() => node.send({ payload: 'tick' }), 10);\nreturn null;")
        .with_version(1);
    let v2 = ScriptDefinition::new("return null;").with_version(2);

    node.execute(&v1, json!({})).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || !host.sent().is_empty()).await);

    node.get_compilation(&v2).await.unwrap();
    assert!(node.timers().is_empty());

    let count = host.sent().len();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(host.sent().len(), count);
    node.close().await;
}

#[tokio::test]
async fn test_close_cancels_timers_and_rejects_calls() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("setInterval(() => {}, 1000);\nsetTimeout(() => {}, 1000);\nreturn null;")
        .with_finalize(appending("fin"));

    node.execute(&def, json!({})).await.unwrap();
    assert_eq!(node.timers().len(), 2);

    node.close().await;

    assert_eq!(node.state(), LifecycleState::Closed);
    assert!(node.timers().is_empty());
    assert_eq!(host.stores().flow.get("log"), Some(json!(["fin"])));
    assert!(matches!(node.execute(&def, json!({})).await, Err(ScriptError::Closed)));

    // Closing twice is harmless
    node.close().await;
}

#[tokio::test]
async fn test_precompile_on_construction() {
    let host = RecordingHost::new("n1").shared();
    let def = ScriptDefinition::new("return msg;").with_initialize(appending("init"));

    let node = ScriptNode::with_definition(
        host.clone(),
        Arc::new(StaticModuleResolver::new()),
        EngineConfig::new(),
        &def,
    )
    .await;

    assert_eq!(node.state(), LifecycleState::Ready);
    assert_eq!(host.stores().flow.get("log"), Some(json!(["init"])));
    assert!(node.current().await.is_some());
    node.close().await;
}

#[tokio::test]
async fn test_precompile_failure_is_reported() {
    let host = RecordingHost::new("n1").shared();
    let def = ScriptDefinition::new("");

    let node = ScriptNode::with_definition(
        host.clone(),
        Arc::new(StaticModuleResolver::new()),
        EngineConfig::new(),
        &def,
    )
    .await;

    assert_eq!(node.state(), LifecycleState::Empty);
    assert_eq!(host.errors(), vec!["Script body is empty".to_string()]);
}

#[tokio::test]
async fn test_concurrent_compilation_is_single_flight() {
    let host = RecordingHost::new("n1").shared();
    let node = Arc::new(node_for(host.clone()));
    let def = ScriptDefinition::new("return msg;")
        .with_initialize(appending("init"))
        .with_version(1);

    let calls = (0..8).map(|_| {
        let node = node.clone();
        let def = def.clone();
        tokio::spawn(async move { node.get_compilation(&def).await })
    });
    let artifacts: Vec<_> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(artifacts.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(host.stores().flow.get("log"), Some(json!(["init"])));
    node.close().await;
}

#[tokio::test]
async fn test_type_errors_are_not_checked() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("const x: string = 5;\nreturn x;");

    let outputs = node.execute(&def, json!({})).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!(5)));
    node.close().await;
}

#[tokio::test]
async fn test_diagnostics_are_warned_not_fatal() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    // A parameter property outside a constructor is recoverable
    let def = ScriptDefinition::new(
        "function add(public a: number, b: number) { return a + b; }\n\
         return { payload: add(2, 3) };",
    );

    let outputs = node.execute(&def, json!({})).await.unwrap();

    assert_eq!(outputs, Outputs::Single(json!({ "payload": 5 })));
    let warnings = host.warnings();
    assert!(!warnings.is_empty());
    assert!(warnings.iter().any(|w| w.contains("parameter property")), "{:?}", warnings);
    assert_eq!(node.state(), LifecycleState::Ready);
    node.close().await;
}

#[tokio::test]
async fn test_async_timer_rejection_is_reported() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new(
        "setTimeout(async () => { throw new Error('async-tick'); }, 10);\nreturn null;",
    );

    node.execute(&def, json!({})).await.unwrap();

    assert!(
        eventually(Duration::from_secs(2), || {
            host.errors()
                .iter()
                .any(|e| e.starts_with("Error in timer callback") && e.contains("async-tick"))
        })
        .await
    );
    node.close().await;
}

#[tokio::test]
async fn test_deeply_nested_message_round_trips() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("return msg;");

    let mut nested = json!("leaf");
    for depth in 0..80 {
        nested = json!({ "depth": depth, "child": nested });
    }
    let msg = json!({ "payload": nested });

    let outputs = node.execute(&def, msg.clone()).await.unwrap();

    assert_eq!(outputs, Outputs::Single(msg));
    node.close().await;
}

#[tokio::test]
async fn test_cyclic_return_is_an_error() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("const a = { payload: 1 };\na.self = a;\nreturn a;");

    let err = assert_err!(node.execute(&def, json!({})).await);

    assert!(err.to_string().contains("cycle"), "{}", err);
    assert_eq!(node.state(), LifecycleState::Ready);
    node.close().await;
}

#[tokio::test]
async fn test_close_interrupts_stuck_runtime() {
    let host = RecordingHost::new("n1").shared();
    let node = Arc::new(ScriptNode::new(
        host.clone(),
        Arc::new(StaticModuleResolver::new()),
        EngineConfig::new()
            .precompile(false)
            .with_finalize_timeout(Duration::from_millis(200)),
    ));
    let def = ScriptDefinition::new("if (msg.spin) { while (true) {} }\nreturn msg;")
        .with_finalize(appending("fin"));

    assert_ok!(node.execute(&def, json!({})).await);

    let stuck = {
        let node = node.clone();
        let def = def.clone();
        tokio::spawn(async move { node.execute(&def, json!({ "spin": true })).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_ok!(tokio::time::timeout(Duration::from_secs(5), node.close()).await);

    assert_eq!(node.state(), LifecycleState::Closed);
    assert!(
        host.errors()
            .iter()
            .any(|e| e.contains("Finalize failed") && e.contains("200ms")),
        "{:?}",
        host.errors()
    );
    let result = assert_ok!(tokio::time::timeout(Duration::from_secs(5), stuck).await);
    assert!(result.unwrap().is_err());
}

#[tokio::test]
async fn test_lifecycle_is_logged_to_host() {
    let host = RecordingHost::new("n1").shared();
    let node = node_for(host.clone());
    let def = ScriptDefinition::new("return msg;");

    node.execute(&def, json!({})).await.unwrap();

    let logs = host.logs();
    assert!(logs.contains(&"Compiling TypeScript (11 chars)".to_string()), "{:?}", logs);
    assert!(logs.contains(&"Script compiled and cached".to_string()));
    assert!(!logs.contains(&"Cleaning up".to_string()));

    node.close().await;
    assert!(host.logs().contains(&"Cleaning up".to_string()));
}

#[tokio::test]
async fn test_registry_closes_nodes() {
    let registry = ScriptNodeRegistry::new(
        Arc::new(StaticModuleResolver::new()),
        EngineConfig::new().precompile(false),
    );
    let a = registry.get_or_create(RecordingHost::new("a").shared());
    let b = registry.get_or_create(RecordingHost::new("b").shared());
    let again = registry.get_or_create(RecordingHost::new("a").shared());

    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(registry.ids(), vec!["a", "b"]);

    a.execute(&ScriptDefinition::new("return 1;"), json!({})).await.unwrap();
    assert!(registry.close("a").await);
    assert!(!registry.close("a").await);
    assert_eq!(a.state(), LifecycleState::Closed);

    registry.close_all().await;
    assert!(registry.is_empty());
    assert_eq!(b.state(), LifecycleState::Closed);
}
