//! Tests for instance loading and teardown against the mock image.

use std::sync::Arc;

use manyrpc::abi::FLUSH_NATIVE_LIBS_SYMBOL;
use manyrpc::abi::NEW_RUNTIME_SYMBOL;
use manyrpc::abi::SET_SELF_SYMBOL;

use crate::mock::MockEvent;
use crate::mock::MockLoader;
use crate::mock::MockSource;
use crate::*;

fn image_spec(loader: &MockLoader, source: MockSource) -> ImageSpec {
    ImageSpec::new(Arc::new(source), Arc::new(loader.clone()))
}

#[test]
fn test_isolated_image_lifecycle() {
    let loader = MockLoader::new();
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");
    assert_eq!(instance.flags(), LoadFlags::LOCAL | LoadFlags::LAZY | LoadFlags::DEEPBIND);

    instance.close().expect("close");

    let events = loader.events();
    assert!(matches!(events[0], MockEvent::Open { image: 0, flags, .. } if flags.contains(LoadFlags::DEEPBIND)));
    assert_eq!(events[1], MockEvent::BindSelf { image: 0 });
    assert!(matches!(events[2], MockEvent::NewRuntime { image: 0, .. }));
    assert_eq!(
        events[3..],
        [MockEvent::Finalize { image: 0 }, MockEvent::Flush { image: 0 }, MockEvent::Close { image: 0 }]
    );
}

#[test]
fn test_plain_image_skips_bind_and_flush() {
    let loader = MockLoader::new();
    let instance =
        Instance::load(0, &image_spec(&loader, MockSource::new().section(2)), &DefaultEnvironment::new())
            .expect("load");
    assert_eq!(instance.flags(), LoadFlags::LOCAL | LoadFlags::LAZY);
    drop(instance);

    let events = loader.events();
    assert_eq!(events.len(), 4);
    assert!(!events.iter().any(|e| matches!(e, MockEvent::BindSelf { .. } | MockEvent::Flush { .. })));
    assert_eq!(events[2..], [MockEvent::Finalize { image: 0 }, MockEvent::Close { image: 0 }]);
}

#[test]
fn test_missing_bind_self_is_integrity_fault() {
    let loader = MockLoader::new().missing_symbol(SET_SELF_SYMBOL);
    let err = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .unwrap_err();
    assert!(matches!(err, Error::Integrity { ref symbol, .. } if symbol == SET_SELF_SYMBOL));

    // The image was opened, so it is closed again; no runtime was ever created.
    assert_eq!(loader.events_for(0).last(), Some(&MockEvent::Close { image: 0 }));
    assert!(loader.runtimes().is_empty());
}

#[test]
fn test_missing_factory_is_integrity_fault() {
    let loader = MockLoader::new().missing_symbol(NEW_RUNTIME_SYMBOL);
    let err = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .unwrap_err();
    assert!(matches!(err, Error::Integrity { ref symbol, .. } if symbol == NEW_RUNTIME_SYMBOL));
}

#[test]
fn test_failed_finalize_leaves_image_open() {
    let loader = MockLoader::new().fail_finalize();
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");

    let err = instance.close().unwrap_err();
    assert!(matches!(err, Error::Teardown(_)));

    let events = loader.events();
    assert_eq!(events.last(), Some(&MockEvent::Finalize { image: 0 }));
    assert!(!events.iter().any(|e| matches!(e, MockEvent::Close { .. })));
}

#[test]
fn test_failed_flush_leaves_image_open() {
    let loader = MockLoader::new().fail_flush();
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");

    assert!(matches!(instance.close(), Err(Error::Teardown(_))));
    assert_eq!(loader.events().last(), Some(&MockEvent::Flush { image: 0 }));
}

#[test]
fn test_missing_flush_symbol_surfaces_on_close() {
    let loader = MockLoader::new().missing_symbol(FLUSH_NATIVE_LIBS_SYMBOL);
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");
    assert!(matches!(instance.close(), Err(Error::Teardown(_))));
}

#[test]
fn test_plugins_are_extracted_and_passed() {
    let loader = MockLoader::new();
    let source = MockSource::new();
    let mut spec = image_spec(&loader, source.clone());
    spec.plugins.push(Payload::plugin("tensor_ops"));
    let env = DefaultEnvironment::new().with_search_path("/srv/models");

    let instance = Instance::load(0, &spec, &env).expect("load");
    assert_eq!(source.extracted(), 2);
    assert_eq!(instance.images().len(), 2);

    let events = loader.events();
    let Some(MockEvent::NewRuntime { extra_paths, plugin_paths, .. }) =
        events.iter().find(|e| matches!(e, MockEvent::NewRuntime { .. }))
    else {
        panic!("no runtime created");
    };
    assert_eq!(extra_paths, &vec![std::path::PathBuf::from("/srv/models")]);
    assert_eq!(plugin_paths, &vec![instance.images()[1].path.clone()]);
}

#[test]
fn test_missing_plugin_aborts_load() {
    let loader = MockLoader::new();
    let mut spec = image_spec(&loader, MockSource::new().missing("tensor_ops"));
    spec.plugins.push(Payload::plugin("tensor_ops"));

    let err = Instance::load(0, &spec, &DefaultEnvironment::new()).unwrap_err();
    assert!(matches!(err, Error::Extract { ref payload, .. } if payload == "tensor_ops"));
}

#[test]
fn test_standalone_session_cannot_replicate() {
    let loader = MockLoader::new();
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");

    let mut session = instance.acquire_session().expect("session");
    assert!(session.manager().is_none());
    assert_eq!(session.slot(), None);

    let value = session.from_value(42i64).expect("from_value");
    let err = session.create_movable(value).unwrap_err();
    assert!(matches!(err, Error::Usage(UsageError::NoManager)));
    assert_eq!(err.to_string(), "Usage error: no manager to register replicated object with");
}

#[test]
fn test_current_value_required() {
    let loader = MockLoader::new();
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");
    let mut session = instance.acquire_session().expect("session");

    assert!(matches!(session.call_current(&[]), Err(Error::Usage(UsageError::NoCurrentValue))));

    let len = session.global("builtins", "len").expect("len");
    session.set_current(len);
    let arg = session.eval("[1, 2, 3]").expect("eval");
    let n = session.call_current(&[arg]).expect("call");
    assert_eq!(session.to_value(n).expect("value"), Value::Int(3));
}

#[test]
fn test_session_closes_runtime_session() {
    let loader = MockLoader::new().through_abi();
    let instance = Instance::load(0, &image_spec(&loader, MockSource::new()), &DefaultEnvironment::new())
        .expect("load");
    let observer = loader.runtime(0).expect("runtime");

    let session = instance.acquire_session().expect("session");
    assert_eq!(observer.open_sessions(), 1);
    drop(session);
    assert_eq!(observer.open_sessions(), 0);
}
