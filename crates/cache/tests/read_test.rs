mod common;

use common::{config, fixture, fixture_with};
use odata_cache::odata_trait::{Method, Response};
use odata_cache::{BindingParameters, CacheConfig, QueryOptions};
use serde_json::json;

fn own(query: QueryOptions) -> BindingParameters {
    BindingParameters {
        query,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_covered_read_is_served_from_cache() {
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

    let first = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    let values = first.await.unwrap();
    assert_eq!(values["Note"], Some(json!("Rush")));

    let again = order.read(&["Note"]).await.unwrap();
    assert_eq!(again["Note"], Some(json!("Rush")));
    assert_eq!(
        f.transport.request_urls(),
        vec!["GET SalesOrderList('1')?$select=Note,SalesOrderID"]
    );
}

#[tokio::test]
async fn test_identical_reads_share_one_request() {
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

    let first = order.read(&["Note"]);
    let second = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();

    assert_eq!(first.await.unwrap()["Note"], Some(json!("Rush")));
    assert_eq!(second.await.unwrap()["Note"], Some(json!("Rush")));
    assert_eq!(f.transport.requests().len(), 1);
}

#[tokio::test]
async fn test_property_missing_in_response_reads_as_none() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$select=Note,SalesOrderID",
        Response::ok(json!({"SalesOrderID": "1"})),
    );

    let read = order.read(&["Note"]);
    f.coordinator.submit_batch("read").await.unwrap();
    let values = read.await.unwrap();
    assert_eq!(values["Note"], None);
}

#[tokio::test]
async fn test_navigation_read_is_expanded_and_shared() {
    let f = fixture();
    let order = f
        .coordinator
        .bind_context("/SalesOrderList('1')", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList('1')?$expand=SO_2_BP($select=CompanyName)&$select=SalesOrderID",
        Response::ok(json!({
            "SalesOrderID": "1",
            "SO_2_BP": {"BusinessPartnerID": "B1", "CompanyName": "SAP"}
        })),
    );

    let read = order.read(&["SO_2_BP/CompanyName"]);
    f.coordinator.submit_batch("read").await.unwrap();
    assert_eq!(read.await.unwrap()["SO_2_BP/CompanyName"], Some(json!("SAP")));

    let partner = f
        .coordinator
        .bind_context("/SalesOrderList('1')/SO_2_BP", own(QueryOptions::empty().with_select(["CompanyName"])))
        .unwrap();
    assert!(!partner.has_own_cache());
    let values = partner.read(&["CompanyName"]).await.unwrap();
    assert_eq!(values["CompanyName"], Some(json!("SAP")));
    assert_eq!(f.transport.requests().len(), 1);
}

#[tokio::test]
async fn test_property_binding_reads_the_property_resource() {
    let f = fixture();
    let name = f
        .coordinator
        .bind_property("/EMPLOYEES('2')/Name", BindingParameters::default())
        .unwrap();
    f.transport.route(
        Method::Get,
        "EMPLOYEES('2')/Name",
        Response::ok(json!({"value": "Frederic Fall"})),
    );

    let value = name.value();
    f.coordinator.submit_batch("read").await.unwrap();
    assert_eq!(value.await.unwrap(), Some(json!("Frederic Fall")));
    assert_eq!(f.transport.request_urls(), vec!["GET EMPLOYEES('2')/Name"]);
}

#[tokio::test]
async fn test_read_range_fills_gap_left_by_delete() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList?$select=SalesOrderID&$skip=0&$top=3",
        Response::ok(json!({"value": [
            {"SalesOrderID": "0500000001"},
            {"SalesOrderID": "0500000002"},
            {"SalesOrderID": "0500000003"}
        ]})),
    );
    f.transport.route(
        Method::Get,
        "SalesOrderList?$select=SalesOrderID&$skip=2&$top=1",
        Response::ok(json!({"value": [{"SalesOrderID": "0500000004"}]})),
    );

    let page = list.read_range(0, 3);
    f.coordinator.submit_batch("read").await.unwrap();
    assert_eq!(page.await.unwrap().len(), 3);

    let deleted = f
        .coordinator
        .delete("/SalesOrderList('0500000002')", None)
        .unwrap();
    f.coordinator.submit_batch("update").await.unwrap();
    deleted.await.unwrap();

    let page = list.read_range(0, 3);
    f.coordinator.submit_batch("read").await.unwrap();
    let ids: Vec<String> = page
        .await
        .unwrap()
        .iter()
        .map(|row| row.data["SalesOrderID"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids, vec!["0500000001", "0500000003", "0500000004"]);
    assert_eq!(
        f.transport.request_urls().last().map(String::as_str),
        Some("GET SalesOrderList?$select=SalesOrderID&$skip=2&$top=1")
    );
}

#[tokio::test]
async fn test_count_includes_created_rows() {
    let f = fixture_with(CacheConfig {
        request_count: true,
        ..config()
    });
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList?$count=true&$select=SalesOrderID&$skip=0&$top=2",
        Response::ok(json!({
            "@odata.count": 5,
            "value": [{"SalesOrderID": "1"}, {"SalesOrderID": "2"}]
        })),
    );

    let page = list.read_range(0, 2);
    f.coordinator.submit_batch("read").await.unwrap();
    page.await.unwrap();
    assert_eq!(list.count().unwrap(), Some(5));

    let _created = list.create(json!({"Note": "New"}), Default::default()).unwrap();
    assert_eq!(list.count().unwrap(), Some(6));
}

#[tokio::test]
async fn test_read_of_unknown_path_fails() {
    let f = fixture();
    let error = f
        .coordinator
        .read("/SalesOrderList('9')", &["Note"])
        .await
        .unwrap_err();
    assert!(error.to_string().contains("nothing is cached"), "{}", error);
}

#[tokio::test]
async fn test_dropping_last_binding_releases_cache() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    let same = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    assert_eq!(f.coordinator.cache_size(), 1);
    drop(list);
    assert_eq!(f.coordinator.cache_size(), 1);
    same.destroy();
    assert_eq!(f.coordinator.cache_size(), 0);
}

#[tokio::test]
async fn test_open_ended_read_range() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList?$select=SalesOrderID&$skip=0&$top=2",
        Response::ok(json!({
            "@odata.count": 2,
            "value": [{"SalesOrderID": "1"}, {"SalesOrderID": "2"}]
        })),
    );
    let page = list.read_range(0, 2);
    f.coordinator.submit_batch("read").await.unwrap();
    page.await.unwrap();

    let rows = list.read_range(1, usize::MAX).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path.to_string(), "/SalesOrderList('2')");
    assert_eq!(f.transport.batch_count(), 1);
}

#[tokio::test]
async fn test_open_ended_read_of_unknown_length_omits_top() {
    let f = fixture();
    let list = f
        .coordinator
        .bind_list("/SalesOrderList", own(QueryOptions::empty()))
        .unwrap();
    f.transport.route(
        Method::Get,
        "SalesOrderList?$select=SalesOrderID&$skip=1",
        Response::ok(json!({"value": [{"SalesOrderID": "2"}, {"SalesOrderID": "3"}]})),
    );

    let page = list.read_range(1, usize::MAX);
    f.coordinator.submit_batch("read").await.unwrap();
    let rows = page.await.unwrap();

    assert_eq!(f.transport.request_urls(), vec!["GET SalesOrderList?$select=SalesOrderID&$skip=1"]);
    assert_eq!(rows.len(), 2);
    assert_eq!(list.count().unwrap(), Some(3));
}
