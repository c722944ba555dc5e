//! Per-instance hook tests
//!
//! Hooking one object must route only that object through the hook chain,
//! keep its presented class stable, coexist with property-observation
//! aliases, and clean itself up when the object deallocates.

use std::sync::{Arc, Mutex};

use graft::hook::{HookClosure, HookMode, HookRegistry};
use graft::runtime::{method_body, ClassId, Runtime};
use graft::Value;

fn greeter() -> (Arc<Runtime>, ClassId) {
    let runtime = Runtime::new();
    let class = runtime.register_class("Greeter", None).unwrap();
    runtime
        .define_method(
            class,
            "rank",
            "i@:",
            method_body(|_, _| Ok(Value::I32(1))),
        )
        .unwrap();
    (runtime, class)
}

fn constant_replacement(value: i32) -> HookClosure {
    HookClosure::new("i@?@?@:", move |_inv| Ok(Value::I32(value))).unwrap()
}

#[test]
fn only_the_hooked_instance_is_affected() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let hooked = runtime.alloc(class).unwrap();
    let sibling = runtime.alloc(class).unwrap();
    registry
        .hook_instance(hooked, "rank", HookMode::Instead, constant_replacement(99))
        .unwrap();

    assert_eq!(runtime.send(hooked, "rank", &[]).unwrap(), Value::I32(99));
    assert_eq!(runtime.send(sibling, "rank", &[]).unwrap(), Value::I32(1));
}

#[test]
fn presented_class_is_unchanged_while_dispatch_class_moves() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let obj = runtime.alloc(class).unwrap();
    let token = registry
        .hook_instance(obj, "rank", HookMode::Instead, constant_replacement(99))
        .unwrap();

    assert_eq!(runtime.class_of(obj).unwrap(), class);
    let actual = runtime.actual_class_of(obj).unwrap();
    assert_ne!(actual, class);
    assert!(runtime.is_dynamic(actual));
    assert_eq!(runtime.origin_of(actual).unwrap(), class);

    // Removal drops the object back to its origin class.
    registry.unhook(&token).unwrap();
    assert_eq!(runtime.actual_class_of(obj).unwrap(), class);
    assert_eq!(runtime.send(obj, "rank", &[]).unwrap(), Value::I32(1));
}

#[test]
fn hooked_instances_share_one_dynamic_subclass() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let first = runtime.alloc(class).unwrap();
    let second = runtime.alloc(class).unwrap();
    registry
        .hook_instance(first, "rank", HookMode::Instead, constant_replacement(7))
        .unwrap();
    registry
        .hook_instance(second, "rank", HookMode::Instead, constant_replacement(8))
        .unwrap();

    assert_eq!(
        runtime.actual_class_of(first).unwrap(),
        runtime.actual_class_of(second).unwrap()
    );
    assert_eq!(runtime.send(first, "rank", &[]).unwrap(), Value::I32(7));
    assert_eq!(runtime.send(second, "rank", &[]).unwrap(), Value::I32(8));
}

#[test]
fn class_wide_and_instance_hooks_compose() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_clone = Arc::clone(&log);
    registry
        .hook_all_instances(
            class,
            "rank",
            HookMode::Before,
            HookClosure::new("v@?@:", move |_inv| {
                log_clone.lock().unwrap().push("class");
                Ok(Value::Unit)
            })
            .unwrap(),
        )
        .unwrap();

    let obj = runtime.alloc(class).unwrap();
    let log_clone = Arc::clone(&log);
    registry
        .hook_instance(
            obj,
            "rank",
            HookMode::Before,
            HookClosure::new("v@?@:", move |_inv| {
                log_clone.lock().unwrap().push("instance");
                Ok(Value::Unit)
            })
            .unwrap(),
        )
        .unwrap();

    assert_eq!(runtime.send(obj, "rank", &[]).unwrap(), Value::I32(1));
    // The dynamic subclass wraps the already-hooked class entry: the
    // instance chain runs first, then delegates into the class chain.
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &["instance", "class"]
    );

    log.lock().unwrap().clear();
    let sibling = runtime.alloc(class).unwrap();
    runtime.send(sibling, "rank", &[]).unwrap();
    assert_eq!(log.lock().unwrap().as_slice(), &["class"]);
}

#[test]
fn observed_objects_are_hooked_on_the_instrumentation_alias() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let obj = runtime.alloc(class).unwrap();
    runtime.observe(obj).unwrap();
    let alias = runtime.actual_class_of(obj).unwrap();
    assert!(runtime.is_instrumented(alias));

    registry
        .hook_instance(obj, "rank", HookMode::Instead, constant_replacement(42))
        .unwrap();

    // No extra subclass is stacked on top of the alias.
    assert_eq!(runtime.actual_class_of(obj).unwrap(), alias);
    assert_eq!(runtime.send(obj, "rank", &[]).unwrap(), Value::I32(42));
    assert_eq!(runtime.class_of(obj).unwrap(), class);
}

#[test]
fn instance_unhook_leaves_no_stale_entry_on_the_shared_subclass() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let obj = runtime.alloc(class).unwrap();
    let token = registry
        .hook_instance(obj, "rank", HookMode::Instead, constant_replacement(99))
        .unwrap();
    registry.unhook(&token).unwrap();

    // A class-wide replacement arriving after that cycle must win
    // everywhere, including on a freshly re-hooked instance.
    registry
        .hook_all_instances(class, "rank", HookMode::Instead, constant_replacement(-5))
        .unwrap();
    let sibling = runtime.alloc(class).unwrap();
    assert_eq!(runtime.send(sibling, "rank", &[]).unwrap(), Value::I32(-5));

    registry
        .hook_instance(
            obj,
            "rank",
            HookMode::Before,
            HookClosure::new("v@?@:", |_inv| Ok(Value::Unit)).unwrap(),
        )
        .unwrap();
    assert_eq!(runtime.send(obj, "rank", &[]).unwrap(), Value::I32(-5));
}

#[test]
fn deallocation_purges_the_instance_chain() {
    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let doomed = runtime.alloc(class).unwrap();
    let survivor = runtime.alloc(class).unwrap();
    registry
        .hook_instance(doomed, "rank", HookMode::Instead, constant_replacement(99))
        .unwrap();
    registry
        .hook_instance(survivor, "rank", HookMode::Instead, constant_replacement(50))
        .unwrap();

    runtime.release(doomed).unwrap();
    assert_eq!(runtime.send(survivor, "rank", &[]).unwrap(), Value::I32(50));
}

#[test]
fn deallocating_the_last_hooked_instance_tears_the_target_down() {
    use graft::hook::TargetKey;

    let (runtime, class) = greeter();
    let registry = HookRegistry::new(Arc::clone(&runtime));

    let doomed = runtime.alloc(class).unwrap();
    registry
        .hook_instance(doomed, "rank", HookMode::Instead, constant_replacement(99))
        .unwrap();
    let subclass = runtime.actual_class_of(doomed).unwrap();
    let key = TargetKey::Method {
        class: subclass,
        selector: "rank".to_string(),
    };
    assert!(registry.is_hooked(&key));

    runtime.release(doomed).unwrap();
    assert!(!registry.is_hooked(&key));

    // The shared subclass resolves the plain entry again, so a fresh
    // instance hook wraps live behavior.
    let fresh = runtime.alloc(class).unwrap();
    registry
        .hook_instance(
            fresh,
            "rank",
            HookMode::Before,
            HookClosure::new("v@?@:", |_inv| Ok(Value::Unit)).unwrap(),
        )
        .unwrap();
    assert_eq!(runtime.send(fresh, "rank", &[]).unwrap(), Value::I32(1));
}
