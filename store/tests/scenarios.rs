/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! End-to-end scenarios driving the whole normalize -> publish -> store ->
//! read pipeline through the public `gql_store` surface, plus the
//! cross-cutting invariants the unit suites inside each module don't each
//! individually cover end to end.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use gql_store::{
    DataId, DefaultGetDataId, Environment, FieldValue, GcScheduler, HandleFieldPayload, Handler,
    HandlerRegistry, ManualScheduler, MatchBranch, MatchField, NoopOperationLoader,
    NormalizationSelection, NormalizationSelector, OperationDescriptor, OptimisticUpdate, Record,
    RecordSourceMutator, ReaderMatchBranch, ReaderMatchField, ReaderSelection, ReaderSelector,
    Store, StoreConfig, StoreUpdater, Variables,
};

fn variables() -> Variables {
    Variables::new()
}

fn user_operation(id: &str, reader_selections: Vec<ReaderSelection>, norm_selections: Vec<NormalizationSelection>) -> Arc<OperationDescriptor> {
    let root_id = DataId::new(id);
    Arc::new(OperationDescriptor {
        name: "UserQuery".into(),
        variables: variables(),
        root_id: root_id.clone(),
        reader_selector: Arc::new(ReaderSelector {
            node_name: "UserQuery".into(),
            data_id: root_id.clone(),
            variables: variables(),
            selections: Arc::new(reader_selections),
        }),
        normalization_selector: Arc::new(NormalizationSelector {
            operation_name: "UserQuery".into(),
            selections: Arc::new(norm_selections),
        }),
    })
}

fn scalar(field_name: &str) -> (ReaderSelection, NormalizationSelection) {
    (
        ReaderSelection::ScalarField {
            field_name: field_name.into(),
            args: vec![],
            response_key: field_name.into(),
        },
        NormalizationSelection::ScalarField {
            field_name: field_name.into(),
            response_key: field_name.into(),
            args: vec![],
        },
    )
}

// Scenario: reading a selector whose record is present but missing one of
// the requested fields reports `is_missing_data` while still returning
// whatever was actually resident.
#[test]
fn scenario_missing_data_read() {
    let store = Rc::new(Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new()));
    let env = Environment::new(store, Rc::new(HandlerRegistry::new()));

    let (name_r, name_n) = scalar("name");
    let (email_r, email_n) = scalar("email");
    let operation = user_operation("1", vec![name_r, email_r], vec![name_n, email_n]);

    // the response never mentions `email`.
    let response = serde_json::json!({"id": "1", "__typename": "User", "name": "Ada"});
    env.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)
        .unwrap();

    let snapshot = env.lookup(&operation);
    assert!(snapshot.is_missing_data);
    assert_eq!(snapshot.data.unwrap().get("name").unwrap(), "Ada");
}

// Scenario: an optimistic rename rebases on top of an authoritative commit
// and reverts cleanly, leaving only the authoritative value once disposed.
#[test]
fn scenario_optimistic_then_authoritative_then_revert() {
    let store = Rc::new(Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new()));
    let env = Environment::new(store, Rc::new(HandlerRegistry::new()));

    let (name_r, name_n) = scalar("name");
    let operation = user_operation("1", vec![name_r], vec![name_n]);

    struct Rename {
        id: DataId,
        name: &'static str,
    }
    impl StoreUpdater for Rename {
        fn update(&self, mutator: &mut RecordSourceMutator<'_>) -> gql_store::Result<()> {
            let mut record = mutator
                .get_for_write(&self.id)
                .unwrap_or_else(|| Record::with_typename(self.id.clone(), "User"));
            record.set("name", FieldValue::Scalar(self.name.into()));
            mutator.set(self.id.clone(), record);
            Ok(())
        }
    }

    let response = serde_json::json!({"id": "1", "__typename": "User", "name": "Real"});
    env.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)
        .unwrap();

    let optimistic = env
        .apply_update(OptimisticUpdate::StoreUpdater(Box::new(Rename {
            id: operation.root_id.clone(),
            name: "Optimistic",
        })))
        .unwrap();
    let snapshot = env.lookup(&operation);
    assert_eq!(snapshot.data.unwrap().get("name").unwrap(), "Optimistic");

    let response2 = serde_json::json!({"id": "1", "__typename": "User", "name": "Real Again"});
    env.commit_operation_payload(Arc::clone(&operation), &response2, &DefaultGetDataId, &NoopOperationLoader, None)
        .unwrap();
    let snapshot = env.lookup(&operation);
    assert_eq!(
        snapshot.data.unwrap().get("name").unwrap(),
        "Optimistic",
        "optimistic update stays rebased on top of the second authoritative write"
    );

    optimistic.dispose();
    let snapshot = env.lookup(&operation);
    assert_eq!(snapshot.data.unwrap().get("name").unwrap(), "Real Again");
}

// Scenario: a `@__clientField` handle runs after normalization and its
// derived value is readable back out under its own response key.
#[test]
fn scenario_handle_field() {
    struct UppercaseHandler;
    impl Handler for UppercaseHandler {
        fn update(&self, mutator: &mut RecordSourceMutator<'_>, payload: &HandleFieldPayload) -> gql_store::Result<()> {
            let mut record = mutator.get_for_write(&payload.data_id).expect("record must exist");
            if let Some(FieldValue::Scalar(serde_json::Value::String(s))) = record.get(&payload.field_key).cloned() {
                record.set(payload.handle_key.clone(), FieldValue::Scalar(s.to_uppercase().into()));
            }
            mutator.set(payload.data_id.clone(), record);
            Ok(())
        }
    }

    let mut handlers = HandlerRegistry::new();
    handlers.register("friendsName", Box::new(UppercaseHandler));
    let store = Rc::new(Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new()));
    let env = Environment::new(store, Rc::new(handlers));

    let (name_r, name_n) = scalar("name");
    let reader_selections = vec![
        name_r,
        ReaderSelection::ClientExtension(gql_store::ClientExtension {
            handle: "friendsName".into(),
            field_name: "name".into(),
            args: vec![],
            key: None,
            filters: None,
        }),
    ];
    let norm_selections = vec![
        name_n,
        NormalizationSelection::ClientExtension(gql_store::ClientExtension {
            handle: "friendsName".into(),
            field_name: "name".into(),
            args: vec![],
            key: None,
            filters: None,
        }),
    ];
    let operation = user_operation("1", reader_selections, norm_selections);

    let response = serde_json::json!({"id": "1", "__typename": "User", "name": "zuck"});
    env.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)
        .unwrap();

    let snapshot = env.lookup(&operation);
    let data = snapshot.data.unwrap();
    assert_eq!(data.get("name").unwrap(), "zuck");
    assert_eq!(data.get("__name_friendsName").unwrap(), "ZUCK");
}

// Scenario: an `@match` field normalizes into the branch matching the
// response's `__typename` and the reader emits a fragment pointer naming
// that branch; an unmatched typename yields no fragment but isn't missing.
#[test]
fn scenario_match_branching() {
    let store = Rc::new(Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new()));
    let env = Environment::new(store, Rc::new(HandlerRegistry::new()));

    let reader_match = ReaderSelection::MatchField(Box::new(ReaderMatchField {
        field_name: "actor".into(),
        args: vec![],
        response_key: "actor".into(),
        fragment_prop_name: "actor".into(),
        branches: vec![ReaderMatchBranch {
            type_name: "User".into(),
            fragment_name: "UserFragment".into(),
        }],
    }));
    let norm_match = NormalizationSelection::MatchField(MatchField {
        field_name: "actor".into(),
        response_key: "actor".into(),
        args: vec![],
        branches: vec![MatchBranch {
            type_name: "User".into(),
            fragment_name: "UserFragment".into(),
            selections: Arc::new(vec![NormalizationSelection::ScalarField {
                field_name: "name".into(),
                response_key: "name".into(),
                args: vec![],
            }]),
        }],
    });
    let operation = user_operation("story-1", vec![reader_match], vec![norm_match]);

    let response = serde_json::json!({
        "id": "story-1",
        "__typename": "Story",
        "actor": {"id": "user-1", "__typename": "User", "name": "Ada"},
    });
    env.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)
        .unwrap();

    let snapshot = env.lookup(&operation);
    let data = snapshot.data.unwrap();
    let actor = data.get("actor").unwrap();
    assert_eq!(actor.get("__id").unwrap(), "user-1");
    assert!(actor.get("__fragments").unwrap().get("UserFragment").is_some());
    assert_eq!(actor.get("__fragmentPropName").unwrap(), "actor");
}

// Scenario: disposing the sole retain on a root schedules a GC pass that
// removes everything unreachable, and nothing still-retained is collected.
#[test]
fn scenario_gc_after_retain_dispose() {
    let scheduler = Arc::new(ManualScheduler::new());
    let config = StoreConfig::new().with_gc_scheduler(scheduler.clone() as Arc<dyn GcScheduler>);
    let store = Store::new(gql_store::InMemoryRecordSource::new(), config);

    let mut root = Record::new(DataId::root());
    root.set("viewer", FieldValue::Ref(DataId::new("user-1")));
    let mut patch = gql_store::InMemoryRecordSource::new();
    patch.set(DataId::root(), Arc::new(root));
    patch.set(DataId::new("user-1"), Arc::new(Record::with_typename(DataId::new("user-1"), "User")));
    patch.set(DataId::new("orphan"), Arc::new(Record::with_typename(DataId::new("orphan"), "User")));
    store.publish(&patch);

    let selector = Arc::new(NormalizationSelector {
        operation_name: "Viewer".into(),
        selections: Arc::new(vec![NormalizationSelection::LinkedField {
            field_name: "viewer".into(),
            response_key: "viewer".into(),
            args: vec![],
            concrete_type: None,
            plural: false,
            selections: Arc::new(vec![]),
        }]),
    });
    let retain = store.retain(selector, DataId::root(), variables());
    assert!(store.source().has(&DataId::new("orphan")), "not collected while nothing has run gc yet");

    retain.dispose();
    scheduler.flush();
    assert!(!store.source().has(&DataId::new("orphan")));
    assert!(!store.source().has(&DataId::new("user-1")), "no root retains it once the only retain is gone");
}

// Scenario: two subscriptions whose reads overlap on a shared record both
// fire on a change to it; a subscription whose data is untouched does not.
#[test]
fn scenario_subscription_overlap() {
    let store = Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new());

    let mut viewer = Record::with_typename(DataId::new("user-1"), "User");
    viewer.set("name", FieldValue::Scalar("Ada".into()));
    let mut patch = gql_store::InMemoryRecordSource::new();
    patch.set(DataId::new("user-1"), Arc::new(viewer));
    let mut other = Record::with_typename(DataId::new("user-2"), "User");
    other.set("name", FieldValue::Scalar("Grace".into()));
    patch.set(DataId::new("user-2"), Arc::new(other));
    store.publish(&patch);

    let (name_r, _) = scalar("name");
    let selector_shared_a = Arc::new(ReaderSelector {
        node_name: "A".into(),
        data_id: DataId::new("user-1"),
        variables: variables(),
        selections: Arc::new(vec![name_r.clone()]),
    });
    let selector_shared_b = Arc::new(ReaderSelector {
        node_name: "B".into(),
        data_id: DataId::new("user-1"),
        variables: variables(),
        selections: Arc::new(vec![name_r.clone()]),
    });
    let selector_untouched = Arc::new(ReaderSelector {
        node_name: "C".into(),
        data_id: DataId::new("user-2"),
        variables: variables(),
        selections: Arc::new(vec![name_r]),
    });

    let fired_a = Rc::new(Cell::new(0));
    let fired_b = Rc::new(Cell::new(0));
    let fired_c = Rc::new(Cell::new(0));

    let snap_a = store.lookup(selector_shared_a, None);
    let snap_b = store.lookup(selector_shared_b, None);
    let snap_c = store.lookup(selector_untouched, None);

    let (fa, fb, fc) = (fired_a.clone(), fired_b.clone(), fired_c.clone());
    let _sub_a = store.subscribe(snap_a, Box::new(move |_| fa.set(fa.get() + 1)));
    let _sub_b = store.subscribe(snap_b, Box::new(move |_| fb.set(fb.get() + 1)));
    let _sub_c = store.subscribe(snap_c, Box::new(move |_| fc.set(fc.get() + 1)));

    let mut changed = Record::with_typename(DataId::new("user-1"), "User");
    changed.set("name", FieldValue::Scalar("Ada Lovelace".into()));
    let mut update = gql_store::InMemoryRecordSource::new();
    update.set(DataId::new("user-1"), Arc::new(changed));
    store.publish(&update);
    store.notify();

    assert_eq!(fired_a.get(), 1);
    assert_eq!(fired_b.get(), 1);
    assert_eq!(fired_c.get(), 0, "subscription over an unrelated record must not fire");
}

// Invariant: committing the same authoritative payload twice is idempotent
// — the second `run()` changes nothing and wakes no subscriptions.
#[test]
fn invariant_idempotent_publish() {
    let store = Rc::new(Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new()));
    let env = Environment::new(store, Rc::new(HandlerRegistry::new()));
    let (name_r, name_n) = scalar("name");
    let operation = user_operation("1", vec![name_r], vec![name_n]);

    let response = serde_json::json!({"id": "1", "__typename": "User", "name": "Ada"});
    env.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)
        .unwrap();

    let subscribed = env.lookup(&operation);
    let calls = Rc::new(Cell::new(0));
    let calls_clone = calls.clone();
    let _sub = env.subscribe(subscribed, Box::new(move |_| calls_clone.set(calls_clone.get() + 1)));

    env.commit_operation_payload(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader, None)
        .unwrap();
    assert_eq!(calls.get(), 0, "re-publishing identical data must not fire subscribers");
}

// Invariant: an applied optimistic update, once reverted, leaves the store
// in exactly the state it would have been in had the update never applied
// (byte-for-byte on the affected record, not merely "close enough").
#[test]
fn invariant_optimistic_undo_is_exact() {
    let mut original = Record::with_typename(DataId::new("1"), "User");
    original.set("name", FieldValue::Scalar("Ada".into()));
    original.set("email", FieldValue::Scalar("ada@example.com".into()));

    let mut base = gql_store::InMemoryRecordSource::new();
    base.set(DataId::new("1"), Arc::new(original.clone()));

    let mut mutator = gql_store::RecordSourceMutator::new(&base, true);
    let mut for_write = mutator.get_for_write(&DataId::new("1")).unwrap();
    for_write.set("name", FieldValue::Scalar("Changed".into()));
    mutator.set(DataId::new("1"), for_write);

    let (mut sink, backup) = mutator.into_sink_and_backup();
    gql_store::unwind(&mut sink, &backup.unwrap());
    assert_eq!(*sink.get_record(&DataId::new("1")).unwrap(), original);
}

// Invariant: GC reachability is transitive — a record only reachable via a
// chain of linked fields from a retained root survives, and the chain
// itself must be intact (break one link and the tail is collected too).
#[test]
fn invariant_gc_reachability_is_transitive() {
    let scheduler = Arc::new(ManualScheduler::new());
    let config = StoreConfig::new().with_gc_scheduler(scheduler.clone() as Arc<dyn GcScheduler>);
    let store = Store::new(gql_store::InMemoryRecordSource::new(), config);

    let mut root = Record::new(DataId::root());
    root.set("viewer", FieldValue::Ref(DataId::new("a")));
    let mut a = Record::with_typename(DataId::new("a"), "User");
    a.set("bestFriend", FieldValue::Ref(DataId::new("b")));
    let b = Record::with_typename(DataId::new("b"), "User");

    let mut patch = gql_store::InMemoryRecordSource::new();
    patch.set(DataId::root(), Arc::new(root));
    patch.set(DataId::new("a"), Arc::new(a));
    patch.set(DataId::new("b"), Arc::new(b));
    store.publish(&patch);

    let selector = Arc::new(NormalizationSelector {
        operation_name: "Viewer".into(),
        selections: Arc::new(vec![NormalizationSelection::LinkedField {
            field_name: "viewer".into(),
            response_key: "viewer".into(),
            args: vec![],
            concrete_type: None,
            plural: false,
            selections: Arc::new(vec![NormalizationSelection::LinkedField {
                field_name: "bestFriend".into(),
                response_key: "bestFriend".into(),
                args: vec![],
                concrete_type: None,
                plural: false,
                selections: Arc::new(vec![]),
            }]),
        }]),
    });
    let retain = store.retain(selector, DataId::root(), variables());
    // force a GC pass via a throwaway retain/dispose cycle so the reachable
    // set is actually computed once before asserting on it.
    let sentinel = store.retain(
        Arc::new(NormalizationSelector { operation_name: "Sentinel".into(), selections: Arc::new(vec![]) }),
        DataId::new("sentinel-nonexistent"),
        variables(),
    );
    sentinel.dispose();
    scheduler.flush();

    assert!(store.source().has(&DataId::new("a")));
    assert!(store.source().has(&DataId::new("b")), "reachable transitively through `a`");
    retain.dispose();
}

// Invariant: identity recycling — re-reading an unchanged subtree returns
// the same `Arc` the previous read produced, not merely an equal value.
#[test]
fn invariant_identity_recycling() {
    let store = Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new());
    let mut viewer = Record::with_typename(DataId::new("1"), "User");
    viewer.set("name", FieldValue::Scalar("Ada".into()));
    let mut patch = gql_store::InMemoryRecordSource::new();
    patch.set(DataId::new("1"), Arc::new(viewer));
    store.publish(&patch);

    let (name_r, _) = scalar("name");
    let selector = Arc::new(ReaderSelector {
        node_name: "F".into(),
        data_id: DataId::new("1"),
        variables: variables(),
        selections: Arc::new(vec![name_r]),
    });

    let first = store.lookup(selector.clone(), None);
    let subscribed = first.data.clone();
    let recycled = gql_store::recycle(&subscribed, store.lookup(selector, None).data);
    assert!(Arc::ptr_eq(&subscribed.unwrap(), &recycled.unwrap()));
}

// Sanity: a second `Environment` over the same underlying `Store` sees
// writes made through the first — the facade is a view, not a second copy.
#[test]
fn environment_is_a_thin_view_over_a_shared_store() {
    let store = Rc::new(Store::new(gql_store::InMemoryRecordSource::new(), StoreConfig::new()));
    let env_a = Environment::new(Rc::clone(&store), Rc::new(HandlerRegistry::new()));
    let env_b = Environment::new(store, Rc::new(HandlerRegistry::new()));

    let (name_r, name_n) = scalar("name");
    let operation = user_operation("1", vec![name_r], vec![name_n]);
    let response = serde_json::json!({"id": "1", "__typename": "User", "name": "Ada"});
    env_a.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)
        .unwrap();

    assert!(env_b.check(&operation));
}
