mod common;

use common::fixture;
use odata_cache::odata_trait::{Method, Response};
use odata_cache::{BindingParameters, CacheConfig, OperationKind, QueryOptions, SubmitMode};
use serde_json::{Map, json};
use std::io::Write;

fn own(query: QueryOptions) -> BindingParameters {
    BindingParameters {
        query,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_submit_waits_for_earlier_group_lock() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=Note,SalesOrderID",
        Response::ok(json!({"SalesOrderID": "1", "Note": "Rush"})),
    );

    let lock = order.lock_group("read", true, false);
    let read = order.read(&["Note"]);
    let coordinator = f.coordinator.clone();
    let submit = tokio::spawn(async move { coordinator.submit_batch("read").await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(f.transport.batch_count(), 0);

    lock.unlock();
    submit.await.unwrap().unwrap();
    read.await.unwrap();
    assert_eq!(f.transport.batch_count(), 1);
}

#[tokio::test]
async fn test_destroyed_binding_releases_its_locks() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    let lock = order.lock_group("update", true, true);
    assert!(lock.is_locked());

    order.destroy();
    assert!(!lock.is_locked());
}

#[tokio::test]
async fn test_dispose_cancels_pending_work_and_reports_leaks() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=Note,SalesOrderID",
        Response::ok(json!({"SalesOrderID": "1", "Note": "Rush"})),
    );
    let read = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();

    let edit = order.update("Note", json!("lost")).unwrap();
    let pending_read = order.read(&["GrossAmount"]);
    let _lock = f.coordinator.lock_group("update", "app", true);

    assert_eq!(f.coordinator.dispose(), 1);
    assert!(edit.await.unwrap_err().is_canceled());
    assert!(pending_read.await.unwrap_err().is_canceled());
    assert!(order.read(&["Note"]).await.is_err());
    assert_eq!(f.coordinator.cache_size(), 0);
    assert_eq!(f.transport.batch_count(), 1);
}

#[tokio::test]
async fn test_bound_action_merges_returned_entity() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=Note,SalesOrderID",
        Response::ok(json!({"@odata.etag": "W/\"1\"", "SalesOrderID": "1", "Note": "Rush"})),
    );
    let read = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();

    f.transport.route(
        Method::Post,
        "SalesOrderList('1')/SalesOrder_Confirm",
        Response::ok(json!({
            "@odata.etag": "W/\"2\"",
            "SalesOrderID": "1",
            "LifecycleStatus": "C"
        })),
    );
    let confirm = f
        .coordinator
        .bind_operation("/SalesOrderList('1')/SalesOrder_Confirm", BindingParameters::default())
        .unwrap();
    let result = confirm.invoke(OperationKind::Action, Map::new()).unwrap();
    f.coordinator.submit_batch("update").await.unwrap();
    let value = result.await.unwrap().unwrap();
    assert_eq!(value["LifecycleStatus"], json!("C"));

    let action = f
        .transport
        .requests()
        .into_iter()
        .find(|request| request.method == Method::Post)
        .unwrap();
    assert_eq!(action.header("If-Match"), Some("W/\"1\""));
    assert_eq!(action.body, Some(json!({})));
    assert!(f.notifier.data_events().iter().any(|(path, properties)| {
        path == "/SalesOrderList('1')" && properties.contains(&"LifecycleStatus".to_string())
    }));
}

#[tokio::test]
async fn test_function_parameters_are_inlined() {
    let f = fixture();
    f.transport.route(
        Method::Get,
        "GetEmployeeByID(EmployeeID='1')",
        Response::ok(json!({"ID": "1", "Name": "Walter Winter"})),
    );

    let mut parameters = Map::new();
    parameters.insert("EmployeeID".to_string(), json!("1"));
    let result = f
        .coordinator
        .invoke("/GetEmployeeByID", OperationKind::Function, parameters, None)
        .unwrap();
    f.coordinator.submit_batch("read").await.unwrap();

    let value = result.await.unwrap().unwrap();
    assert_eq!(value["Name"], json!("Walter Winter"));
    assert_eq!(f.transport.request_urls(), vec!["GET GetEmployeeByID(EmployeeID='1')"]);
}

#[tokio::test]
async fn test_empty_operation_response_yields_none() {
    let f = fixture();
    let result = f
        .coordinator
        .invoke("/ResetDemoData", OperationKind::Action, Map::new(), None)
        .unwrap();
    f.coordinator.submit_batch("update").await.unwrap();
    assert_eq!(result.await.unwrap(), None);
}

#[tokio::test]
async fn test_change_sets_split_at_add_change_set() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList?$select=SalesOrderID&$skip=0&$top=2",
        Response::ok(json!({"value": [{"SalesOrderID": "1"}, {"SalesOrderID": "2"}]})),
    );
    let page = list.read_range(0, 2);
    f.coordinator.submit_batch("read").await.unwrap();
    page.await.unwrap();

    let first = f
        .coordinator
        .update("/SalesOrderList('1')", "Note", json!("a"), None)
        .unwrap();
    f.coordinator.add_change_set("update");
    let second = f
        .coordinator
        .update("/SalesOrderList('2')", "Note", json!("b"), None)
        .unwrap();
    f.coordinator.submit_batch("update").await.unwrap();
    first.await.unwrap();
    second.await.unwrap();

    let (group, requests) = f.transport.batches().pop().unwrap();
    assert_eq!(group, "update");
    let change_sets: Vec<Option<u32>> = requests.iter().map(|request| request.change_set).collect();
    assert_eq!(change_sets, vec![Some(1), Some(2)]);
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        group_id = "read"
        update_group_id = "update"
        page_size = 50

        [groups]
        update = "auto"
        "#
    )
    .unwrap();

    let config = CacheConfig::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.group_id, "read");
    assert_eq!(config.page_size, 50);
    assert_eq!(config.submit_mode("update"), SubmitMode::Auto);
    assert_eq!(config.submit_mode("read"), SubmitMode::Api);
}

#[test]
fn test_config_rejects_invalid_group() {
    let error = CacheConfig::from_toml_str(r#"update_group_id = "not valid""#).unwrap_err();
    assert!(error.to_string().contains("Invalid group ID"), "{}", error);
}
