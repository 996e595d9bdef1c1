//! Runs the whole pipeline — normalize a response, publish it, subscribe to
//! a selector, apply and revert an optimistic update — against a
//! hand-written fake payload. No network, no compiler: the selection trees
//! below are what a real GraphQL compiler would hand this crate.

use std::rc::Rc;
use std::sync::Arc;

use gql_store::{
    DataId, DefaultGetDataId, Environment, FieldArg, HandlerRegistry, InMemoryRecordSource, NoopOperationLoader,
    NormalizationSelection, NormalizationSelector, OperationDescriptor, OptimisticUpdate, ReaderSelection, ReaderSelector,
    Record, FieldValue, RecordSourceMutator, Store, StoreConfig, StoreUpdater, Variables,
};

fn user_query(id: &str) -> Arc<OperationDescriptor> {
    let root_id = DataId::new(id);
    Arc::new(OperationDescriptor {
        name: "UserQuery".into(),
        variables: {
            let mut vars = Variables::new();
            vars.insert("id".into(), serde_json::Value::String(id.into()));
            vars
        },
        root_id: root_id.clone(),
        reader_selector: Arc::new(ReaderSelector {
            node_name: "UserQuery".into(),
            data_id: root_id.clone(),
            variables: Variables::new(),
            selections: Arc::new(vec![
                ReaderSelection::ScalarField {
                    field_name: "name".into(),
                    args: vec![],
                    response_key: "name".into(),
                },
                ReaderSelection::ScalarField {
                    field_name: "email".into(),
                    args: vec![],
                    response_key: "email".into(),
                },
            ]),
        }),
        normalization_selector: Arc::new(NormalizationSelector {
            operation_name: "UserQuery".into(),
            selections: Arc::new(vec![
                NormalizationSelection::ScalarField {
                    field_name: "name".into(),
                    response_key: "name".into(),
                    args: vec![FieldArg::variable("id", "id")],
                },
                NormalizationSelection::ScalarField {
                    field_name: "email".into(),
                    response_key: "email".into(),
                    args: vec![],
                },
            ]),
        }),
    })
}

struct RenameUser {
    id: DataId,
    name: &'static str,
}

impl StoreUpdater for RenameUser {
    fn update(&self, mutator: &mut RecordSourceMutator<'_>) -> gql_store::Result<()> {
        let mut record = mutator
            .get_for_write(&self.id)
            .unwrap_or_else(|| Record::with_typename(self.id.clone(), "User"));
        record.set("name", FieldValue::Scalar(self.name.into()));
        mutator.set(self.id.clone(), record);
        Ok(())
    }
}

fn print_snapshot(label: &str, env: &Environment, operation: &OperationDescriptor) {
    let snapshot = env.lookup(operation);
    match snapshot.data {
        Some(data) => println!("{label}: {data} (missing_data={})", snapshot.is_missing_data),
        None => println!("{label}: <absent>"),
    }
}

fn main() -> gql_store::Result<()> {
    env_logger::init();

    let store = Rc::new(Store::new(InMemoryRecordSource::new(), StoreConfig::new()));
    let handlers = Rc::new(HandlerRegistry::new());
    let env = Environment::new(store, handlers);

    let operation = user_query("1");

    let response = serde_json::json!({
        "id": "1",
        "__typename": "User",
        "name": "Ada Lovelace",
        "email": "ada@example.com",
    });
    let execution = env.execute(Arc::clone(&operation), &response, &DefaultGetDataId, &NoopOperationLoader)?;
    print_snapshot("after execute", &env, &operation);

    let subscribed = env.lookup(&operation);
    let disposable = env.subscribe(
        subscribed,
        Box::new(|snapshot| {
            println!("subscriber fired: {:?}", snapshot.data);
        }),
    );

    let optimistic = env.apply_update(OptimisticUpdate::StoreUpdater(Box::new(RenameUser {
        id: operation.root_id.clone(),
        name: "Ada (saving...)",
    })))?;
    print_snapshot("after optimistic rename", &env, &operation);

    let authoritative = serde_json::json!({
        "id": "1",
        "__typename": "User",
        "name": "Ada Lovelace",
        "email": "ada@example.com",
    });
    env.commit_operation_payload(Arc::clone(&operation), &authoritative, &DefaultGetDataId, &NoopOperationLoader, None)?;
    print_snapshot("after authoritative commit (optimistic still rebased on top)", &env, &operation);

    optimistic.dispose();
    print_snapshot("after reverting the optimistic rename", &env, &operation);

    disposable.dispose();
    execution.retain.dispose();
    Ok(())
}
