mod common;

use common::fixture;
use odata_cache::odata_trait::{Method, MessageType, ODataError, Response};
use odata_cache::{BindingParameters, QueryOptions};
use serde_json::json;

fn own(query: QueryOptions) -> BindingParameters {
    BindingParameters {
        query,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_refresh_replaces_entity_messages() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.script(vec![Response::ok(json!({
        "SalesOrderID": "1",
        "Note": "Rush",
        "Messages": [{"message": "Check delivery date", "numericSeverity": 3, "target": "Note"}]
    }))]);

    let read = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();
    let messages = f.coordinator.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].target, "/SalesOrderList('1')/Note");
    assert_eq!(messages[0].message_type, MessageType::Warning);

    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=Note,SalesOrderID",
        Response::ok(json!({"SalesOrderID": "1", "Note": "Rush", "Messages": []})),
    );
    let refreshed = order.refresh(false).unwrap();
    f.coordinator.submit_batch("read").await.unwrap();
    refreshed.await.unwrap();

    assert!(f.coordinator.messages().is_empty());
    assert_eq!(f.notifier.removed_messages().len(), 1);
    assert_eq!(
        f.transport.request_urls(),
        vec![
            "GET SalesOrderList('1')?$select=Note,SalesOrderID",
            "GET SalesOrderList('1')?$select=Note,SalesOrderID",
        ]
    );
}

#[tokio::test]
async fn test_refresh_rejects_pending_changes() {
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

    let _edit = order.update("Note", json!("changed")).unwrap();
    let error = order.refresh(false).err().expect("refresh should fail with pending changes");
    assert!(matches!(error, ODataError::Validation { .. }), "{:?}", error);
}

#[tokio::test]
async fn test_refresh_reloads_list_pages() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    f.transport.script(vec![Response::ok(json!({
        "value": [{"SalesOrderID": "1"}, {"SalesOrderID": "2"}]
    }))]);
    let page = list.read_range(0, 2);
    f.coordinator.submit_batch("read").await.unwrap();
    page.await.unwrap();

    f.transport.route(
        Method::Get,
        "SalesOrderList?$select=SalesOrderID&$skip=0&$top=2",
        Response::ok(json!({"value": [{"SalesOrderID": "2"}, {"SalesOrderID": "3"}]})),
    );
    let refreshed = list.refresh(false).unwrap();
    f.coordinator.submit_batch("read").await.unwrap();
    refreshed.await.unwrap();

    let rows = list.read_range(0, 2).await.unwrap();
    let ids: Vec<String> = rows.iter().map(|row| row.path.to_string()).collect();
    assert_eq!(ids, vec!["/SalesOrderList('2')", "/SalesOrderList('3')"]);
    assert_eq!(f.transport.batch_count(), 2);
}

#[tokio::test]
async fn test_refresh_with_removal_drops_row_outside_filter() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list(
            "/SalesOrderList",
            own(QueryOptions::empty().with_filter("LifecycleStatus eq 'N'")),
        )
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList?$filter=LifecycleStatus eq 'N'&$select=SalesOrderID&$skip=0&$top=2",
        Response::ok(json!({
            "@odata.count": 2,
            "value": [{"SalesOrderID": "1"}, {"SalesOrderID": "2"}]
        })),
    );
    let page = list.read_range(0, 2);
    f.coordinator.submit_batch("read").await.unwrap();
    page.await.unwrap();

    f.transport.route(
        Method::Get,
        "SalesOrderList?$filter=(LifecycleStatus eq 'N') and SalesOrderID eq '1'&$select=SalesOrderID",
        Response::ok(json!({"value": []})),
    );
    let refreshed = f
        .coordinator
        .refresh("/SalesOrderList('1')", true, None)
        .unwrap();
    f.coordinator.submit_batch("read").await.unwrap();
    refreshed.await.unwrap();

    let rows = list.read_range(0, 2).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path.to_string(), "/SalesOrderList('2')");
    assert_eq!(list.count().unwrap(), Some(1));
    assert!(
        f.notifier
            .changed_paths()
            .contains(&"/SalesOrderList".to_string())
    );
}

#[tokio::test]
async fn test_side_effects_reload_affected_entity_properties() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=GrossAmount,Note,SalesOrderID",
        Response::ok(json!({"SalesOrderID": "1", "Note": "Rush", "GrossAmount": "5"})),
    );
    let read = order.read(&["Note", "GrossAmount"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();

    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=GrossAmount,SalesOrderID",
        Response::ok(json!({"SalesOrderID": "1", "GrossAmount": "99"})),
    );
    let reloaded = order.request_side_effects(&["GrossAmount"]).unwrap();
    f.coordinator.submit_batch("read").await.unwrap();
    reloaded.await.unwrap();

    let values = order.read(&["Note", "GrossAmount"]).await.unwrap();
    assert_eq!(values["GrossAmount"], Some(json!("99")));
    assert_eq!(values["Note"], Some(json!("Rush")));
    assert_eq!(f.transport.batch_count(), 2);
}

#[tokio::test]
async fn test_side_effects_skip_uncached_paths() {
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

    order
        .request_side_effects(&["DeliveryDate"])
        .unwrap()
        .await
        .unwrap();
    f.coordinator.submit_batch("read").await.unwrap();
    assert_eq!(f.transport.batch_count(), 1);
}

#[tokio::test]
async fn test_side_effects_reload_loaded_rows_of_dependent_list() {
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

    let items = f
        .coordinator
        .bind_list(
            "/SalesOrderList('1')/SO_2_SOITEM",
            BindingParameters {
                query: QueryOptions::empty().with_select(["Quantity"]),
                own_request: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(items.has_own_cache());
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')/SO_2_SOITEM?$select=ItemPosition,Quantity,SalesOrderID&$skip=0&$top=2",
        Response::ok(json!({
            "@odata.count": 2,
            "value": [
                {"SalesOrderID": "1", "ItemPosition": "10", "Quantity": "1"},
                {"SalesOrderID": "1", "ItemPosition": "20", "Quantity": "2"}
            ]
        })),
    );
    let page = items.read_range(0, 2);
    f.coordinator.submit_batch("read").await.unwrap();
    page.await.unwrap();

    let url = "SalesOrderList('1')/SO_2_SOITEM?$filter=SalesOrderID eq '1' and ItemPosition eq '10' \
               or SalesOrderID eq '1' and ItemPosition eq '20'&$select=ItemPosition,Quantity,SalesOrderID&$top=2";
    f.transport.route(
        Method::Get,
        url,
        Response::ok(json!({"value": [
            {"SalesOrderID": "1", "ItemPosition": "20", "Quantity": "7"},
            {"SalesOrderID": "1", "ItemPosition": "10", "Quantity": "1"}
        ]})),
    );
    let reloaded = order
        .request_side_effects(&["SO_2_SOITEM/Quantity"])
        .unwrap();
    f.coordinator.submit_batch("read").await.unwrap();
    reloaded.await.unwrap();

    assert_eq!(f.transport.request_urls().last(), Some(&format!("GET {}", url)));
    let rows = items.read_range(0, 2).await.unwrap();
    assert_eq!(rows[0].data["Quantity"], json!("1"));
    assert_eq!(rows[1].data["Quantity"], json!("7"));
    assert_eq!(f.transport.batch_count(), 3);
}

#[tokio::test]
async fn test_read_without_message_annotation_keeps_messages() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.script(vec![Response::ok(json!({
        "SalesOrderID": "1",
        "Note": "Rush",
        "Messages": [{"message": "Check delivery date", "numericSeverity": 3, "target": "Note"}]
    }))]);
    let read = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();
    assert_eq!(f.coordinator.messages().len(), 1);

    f.transport
        .script(vec![Response::ok(json!({"SalesOrderID": "1", "GrossAmount": "5"}))]);
    let read = order.read(&["GrossAmount"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();

    let messages = f.coordinator.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "Check delivery date");
    assert!(f.notifier.removed_messages().is_empty());
    assert_eq!(f.transport.batch_count(), 2);
}

#[tokio::test]
async fn test_entity_messages_leave_dependent_list_messages_alone() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    let _items = f
        .coordinator
        .bind_list(
            "/SalesOrderList('1')/SO_2_SOITEM",
            BindingParameters {
                query: QueryOptions::empty().with_select(["Quantity"]),
                own_request: true,
                ..Default::default()
            },
        )
        .unwrap();
    f.transport.script(vec![Response::ok(json!({
        "SalesOrderID": "1",
        "Note": "Rush",
        "Messages": [
            {"message": "Check delivery date", "numericSeverity": 3, "target": "Note"},
            {
                "message": "Quantity exceeds stock",
                "numericSeverity": 3,
                "target": "SO_2_SOITEM(SalesOrderID='1',ItemPosition='10')/Quantity"
            }
        ]
    }))]);
    let read = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();
    assert_eq!(f.coordinator.messages().len(), 2);

    f.transport.script(vec![Response::ok(json!({
        "SalesOrderID": "1",
        "GrossAmount": "5",
        "Messages": []
    }))]);
    let read = order.read(&["GrossAmount"]);
    f.coordinator.submit_batch("read").await.unwrap();
    read.await.unwrap();

    let messages = f.coordinator.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].target,
        "/SalesOrderList('1')/SO_2_SOITEM(SalesOrderID='1',ItemPosition='10')/Quantity"
    );
}
