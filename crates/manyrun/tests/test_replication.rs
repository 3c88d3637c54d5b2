//! Moving values between instances with replicated values.

use std::sync::Arc;
use std::thread;

use manyrpc::FaultKind;
use manyrun::mock::MockLoader;
use manyrun::mock::MockSource;
use manyrun::DefaultEnvironment;
use manyrun::Error;
use manyrun::InstanceManager;
use manyrun::UsageError;
use manyrun::Value;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::EnvFilter;

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager(count: usize) -> (InstanceManager, MockLoader) {
    let loader = MockLoader::new();
    let manager = InstanceManager::builder()
        .instances(count)
        .environment(Arc::new(DefaultEnvironment::new()))
        .source(MockSource::new())
        .loader(loader.clone())
        .build()
        .expect("Failed to build manager");
    (manager, loader)
}

/// Identity of the runtime object behind the session's current value.
fn current_identity(session: &mut manyrun::Session<'_>) -> Value {
    let current = session.current().expect("current value");
    let id = session.global("builtins", "id").expect("id builtin");
    let identity = session.call(id, &[current]).expect("id call");
    session.to_value(identity).expect("identity value")
}

#[test]
fn test_values_survive_the_move() {
    initialize_tracing();
    let (manager, _loader) = manager(2);
    let source = manager.instance(0).expect("instance 0");
    let target = manager.instance(1).expect("instance 1");

    let values = vec![
        Value::None,
        Value::Bool(true),
        Value::Int(-17),
        Value::Float(2.5),
        Value::Str("héllo".into()),
        Value::List(vec![Value::Int(1), Value::List(vec![Value::Str("nested".into())])]),
    ];

    for value in values {
        let mut session = manager.acquire_session_on(source).expect("session");
        let obj = session.from_value(value.clone()).expect("from_value");
        let movable = session.create_movable(obj).expect("create_movable");
        drop(session);

        let mut session = movable.acquire_session(Some(target)).expect("materialize");
        assert_eq!(session.current_value().expect("value"), value);
    }
}

#[test]
fn test_materialization_is_cached_per_instance() {
    let (manager, loader) = manager(2);
    let target = manager.instance(1).expect("instance 1");

    let mut session = manager.acquire_session_on(manager.instance(0).expect("instance 0")).expect("session");
    let obj = session.eval("[1, 2, 3]").expect("eval");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    let mut first = movable.acquire_session(Some(target)).expect("first");
    let mut second = movable.acquire_session(Some(target)).expect("second");
    assert_eq!(current_identity(&mut first), current_identity(&mut second));

    // Materializing again through an existing session is also a lookup.
    let again = second.from_movable(&movable).expect("again");
    second.set_current(again);
    assert_eq!(current_identity(&mut first), current_identity(&mut second));

    let observer = loader.runtime(1).expect("runtime 1");
    assert_eq!(observer.unpickle_count(), 1);
    assert!(observer.holds(movable.id()));
    assert!(!loader.runtime(0).expect("runtime 0").holds(movable.id()));
}

#[test]
fn test_foreign_objects_cannot_be_replicated() {
    let (manager, _loader) = manager(2);
    let first = manager.instance(0).expect("instance 0");
    let second = manager.instance(1).expect("instance 1");

    let mut owner = manager.acquire_session_on(first).expect("owner");
    let obj = owner.from_value(Value::Int(5)).expect("from_value");

    // Another instance.
    let mut other_instance = manager.acquire_session_on(second).expect("other instance");
    let err = other_instance.create_movable(obj).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::ForeignValue)));
    assert_eq!(err.to_string(), "Usage error: cannot replicate a value living in a different instance");

    // Another session on the same instance.
    let mut other_session = manager.acquire_session_on(first).expect("other session");
    let err = other_session.create_movable(obj).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::ForeignValue)));

    assert!(owner.create_movable(obj).is_ok());
}

#[test]
fn test_unload_everywhere_then_materialize_fails() {
    let (manager, loader) = manager(3);

    let mut session = manager.acquire_session().expect("session");
    let obj = session.from_value("weights").expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    for instance in manager.instances() {
        movable.acquire_session(Some(instance)).expect("materialize");
    }
    assert!(loader.runtimes().iter().all(|r| r.holds(movable.id())));

    movable.unload(None).expect("unload all");
    assert!(movable.is_unloaded());
    assert!(loader.runtimes().iter().all(|r| !r.holds(movable.id())));

    let err = movable.acquire_session(None).unwrap_err();
    assert!(matches!(err, Error::ObjectNotFound(id) if id == movable.id()));

    // A second unload-all is a no-op.
    movable.unload(None).expect("unload all again");
}

#[test]
fn test_unload_from_one_instance() {
    let (manager, loader) = manager(2);
    let first = manager.instance(0).expect("instance 0");
    let second = manager.instance(1).expect("instance 1");

    let mut session = manager.acquire_session_on(first).expect("session");
    let obj = session.from_value(Value::Int(99)).expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    movable.acquire_session(Some(first)).expect("materialize first");
    movable.acquire_session(Some(second)).expect("materialize second");

    movable.unload(Some(second)).expect("unload");
    assert!(!loader.runtime(1).expect("runtime 1").holds(movable.id()));
    assert!(loader.runtime(0).expect("runtime 0").holds(movable.id()));
    assert!(!movable.is_unloaded());

    // Unloading again, or from an instance that never held it, is fine.
    movable.unload(Some(second)).expect("unload again");

    // The handle still works: the instance unpickles it afresh.
    let mut session = movable.acquire_session(Some(second)).expect("rematerialize");
    assert_eq!(session.current_value().expect("value"), Value::Int(99));
    assert_eq!(loader.runtime(1).expect("runtime 1").unpickle_count(), 2);
}

#[test]
fn test_unload_before_any_materialization() {
    let (manager, _loader) = manager(2);
    let mut session = manager.acquire_session().expect("session");
    let obj = session.from_value(true).expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    movable.unload(manager.instance(1)).expect("unload from untouched instance");
}

#[test]
fn test_unload_rejects_foreign_instance() {
    let (a, _) = manager(1);
    let (b, _) = manager(1);

    let mut session = a.acquire_session().expect("session");
    let obj = session.from_value(1i64).expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    let err = movable.unload(b.instance(0)).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::ForeignInstance)));
}

#[test]
fn test_materialize_into_foreign_manager_rejected() {
    let (a, _) = manager(1);
    let (b, b_loader) = manager(1);

    let mut session = a.acquire_session().expect("session");
    let obj = session.from_value(Value::Int(3)).expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    let mut foreign = b.acquire_session().expect("foreign session");
    let err = foreign.from_movable(&movable).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::ForeignInstance)));
    assert_eq!(b_loader.runtime(0).expect("runtime").unpickle_count(), 0);

    let err = movable.acquire_session(b.instance(0)).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::ForeignInstance)));
}

#[test]
fn test_dropping_last_handle_unloads() {
    let (manager, loader) = manager(2);

    let mut session = manager.acquire_session().expect("session");
    let obj = session.from_value(Value::Str("shared".into())).expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);
    let id = movable.id();

    for instance in manager.instances() {
        movable.acquire_session(Some(instance)).expect("materialize");
    }

    let clone = movable.clone();
    drop(movable);
    assert!(loader.runtimes().iter().all(|r| r.holds(id)), "a clone is still alive");

    drop(clone);
    assert!(loader.runtimes().iter().all(|r| !r.holds(id)));
    assert!(loader.runtimes().iter().all(|r| r.replicated_count() == 0));
}

#[test]
fn test_identifiers_are_unique_per_manager() {
    let (manager, _loader) = manager(2);
    let mut session = manager.acquire_session().expect("session");

    let mut ids = Vec::new();
    let mut handles = Vec::new();
    for i in 0..10 {
        let obj = session.from_value(Value::Int(i)).expect("from_value");
        let movable = session.create_movable(obj).expect("create_movable");
        ids.push(movable.id());
        handles.push(movable);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[test]
fn test_unpicklable_object_is_runtime_fault() {
    let (manager, _loader) = manager(1);
    let mut session = manager.acquire_session().expect("session");
    let builtin = session.global("builtins", "len").expect("len");

    match session.create_movable(builtin) {
        Err(Error::Runtime(fault)) => assert_eq!(fault.kind, FaultKind::Runtime),
        other => panic!("Expected Runtime fault, got {:?}", other),
    }
}

#[test]
fn test_balanced_materialization_holds_a_slot() {
    let (manager, _loader) = manager(2);
    let mut session = manager.acquire_session().expect("session");
    let obj = session.from_value(Value::Int(1)).expect("from_value");
    let movable = session.create_movable(obj).expect("create_movable");
    drop(session);

    let session = movable.acquire_session(None).expect("materialize");
    assert!(session.slot().is_some());
    assert_eq!(manager.loads().iter().sum::<u64>(), 1);
    drop(session);
    assert_eq!(manager.loads().iter().sum::<u64>(), 0);
}

#[test]
fn test_methods_called_on_materialized_value() {
    let (manager, _loader) = manager(2);
    manager.register_module_source("config", "scale = 3");

    let mut session = manager.acquire_session_on(manager.instance(0).expect("instance 0")).expect("session");
    let scale = session.global("config", "scale").expect("global");
    let movable = session.create_movable(scale).expect("create_movable");
    drop(session);

    let mut session = movable.acquire_session(manager.instance(1)).expect("materialize");
    let add = session.global("builtins", "add").expect("add");
    let current = session.current().expect("current");
    let ten = session.from_value(Value::Int(10)).expect("from_value");
    let sum = session.call(add, &[current, ten]).expect("call");
    assert_eq!(session.to_value(sum).expect("value"), Value::Int(13));
}

#[test]
fn test_concurrent_replication() {
    initialize_tracing();
    const THREADS: usize = 6;
    const ITEMS: i64 = 40;

    let (manager, loader) = manager(3);

    thread::scope(|s| {
        for t in 0..THREADS {
            let manager = &manager;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                let mut handles = Vec::new();

                for i in 0..ITEMS {
                    let value = Value::List(vec![Value::Int(t as i64), Value::Int(i)]);
                    let mut session = manager.acquire_session().expect("session");
                    let obj = session.from_value(value.clone()).expect("from_value");
                    let movable = session.create_movable(obj).expect("create_movable");
                    drop(session);

                    let target = manager.instance(rng.gen_range(0..manager.len()));
                    let mut session = movable.acquire_session(target).expect("materialize");
                    assert_eq!(session.current_value().expect("value"), value);
                    drop(session);

                    if rng.gen_bool(0.3) {
                        movable.unload(None).expect("unload");
                    } else {
                        handles.push(movable);
                    }
                }
            });
        }
    });

    // Every handle was unloaded or dropped at the end of its thread.
    assert!(loader.runtimes().iter().all(|r| r.replicated_count() == 0));
    assert_eq!(manager.loads().iter().sum::<u64>(), 0);
}
