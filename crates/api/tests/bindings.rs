#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tally_api::{ClientConfig, Collections, DataError, MutationKind, MutationOutcome, QueryResult, QuerySpec, QueryStatus, Record};
use tally_remote::{MockTable, RemoteTable};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: i64,
    name: String,
    qty: i64,
}

fn rec(v: Value) -> Record { v.as_object().cloned().unwrap() }

fn item(id: i64, name: &str, qty: i64) -> Item { Item { id, name: name.to_string(), qty } }

fn setup() -> (Arc<MockTable>, Collections) {
    let mock = Arc::new(MockTable::new());
    mock.memory()
        .seed(
            "items",
            vec![rec(json!({"id": 1, "name": "A", "qty": 5})), rec(json!({"id": 2, "name": "B", "qty": 0}))],
        )
        .unwrap();
    let table: Arc<dyn RemoteTable> = mock.clone();
    (mock, Collections::new(table))
}

async fn until<T>(rx: &mut watch::Receiver<QueryResult<T>>, f: impl FnMut(&QueryResult<T>) -> bool) -> QueryResult<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(f))
        .await
        .expect("state not reached in time")
        .expect("binding closed")
        .clone()
}

#[tokio::test]
async fn binding_starts_loading_then_resolves() {
    let (_mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items").eq("qty", 0));
    let first = binding.current();
    assert!(first.is_loading() || first.is_success());

    let settled = binding.settled().await;
    assert_eq!(settled.status, QueryStatus::Success);
    assert_eq!(*settled.data, vec![item(2, "B", 0)]);
    assert!(settled.error.is_none());
}

#[tokio::test]
async fn insert_invalidates_bound_query() {
    let (_mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items").order_by("id", true));
    assert_eq!(binding.settled().await.data.len(), 2);
    let mut rx = binding.subscribe();

    let created = api.insert::<Item>("items").mutate(&json!({"name": "C", "qty": 10})).await.unwrap();
    assert_eq!(created, MutationOutcome::Record(item(3, "C", 10)));

    let after = until(&mut rx, |s| s.is_success() && s.data.len() == 3).await;
    assert_eq!(*after.data, vec![item(1, "A", 5), item(2, "B", 0), item(3, "C", 10)]);
}

#[tokio::test]
async fn update_passes_through_loading_and_refreshes() {
    let (mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items").order_by("id", true));
    assert_eq!(binding.settled().await.data[0].qty, 5);
    let mut rx = binding.subscribe();

    mock.push_read_delay(Duration::from_millis(50));
    let updated = api.update::<Item>("items").mutate(&json!({"id": 1, "qty": 7})).await.unwrap();
    assert_eq!(updated.into_record(), Some(item(1, "A", 7)));

    let loading = until(&mut rx, |s| s.is_loading()).await;
    // previous data stays visible while refetching
    assert_eq!(loading.data[0].qty, 5);
    let fresh = until(&mut rx, |s| s.is_success()).await;
    assert_eq!(fresh.data[0], item(1, "A", 7));
}

#[tokio::test]
async fn newer_spec_wins_over_slow_older_request() {
    let (mock, api) = setup();
    mock.push_read_delay(Duration::from_millis(100));
    let binding = api.query::<Item>(QuerySpec::new("items").eq("qty", 5));
    // let the first read start and park on its delay
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mock.reads(), 1);

    assert!(binding.set_spec(QuerySpec::new("items").eq("qty", 0)));
    assert!(binding.current().is_loading());
    let settled = binding.settled().await;
    assert_eq!(*settled.data, vec![item(2, "B", 0)]);

    // give the superseded request time to land
    tokio::time::sleep(Duration::from_millis(150)).await;
    let later = binding.current();
    assert_eq!(*later.data, vec![item(2, "B", 0)]);
    assert_eq!(later.generation, binding.generation());
}

#[tokio::test]
async fn equal_spec_is_not_a_change() {
    let (mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items"));
    let settled = binding.settled().await;
    assert!(!binding.set_spec(QuerySpec::new("items")));
    assert!(!binding.update_spec(|s| s.limit = None));
    assert_eq!(binding.generation(), settled.generation);
    assert_eq!(mock.reads(), 1);

    assert!(binding.update_spec(|s| s.limit = Some(1)));
    let next = binding.settled_after(settled.generation + 1).await;
    assert_eq!(next.data.len(), 1);
}

#[tokio::test]
async fn failed_mutation_changes_nothing() {
    let (mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items"));
    let before = binding.settled().await;

    mock.fail_next_mutation(DataError::validation_code("23514", "qty must be >= 0"));
    let err = api.update::<Item>("items").mutate(&json!({"id": 1, "qty": -1})).await.unwrap_err();
    assert_eq!(err.code(), Some("23514"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let after = binding.current();
    assert_eq!(after.status, QueryStatus::Success);
    assert_eq!(after.generation, before.generation);
    assert_eq!(*after.data, *before.data);
    assert_eq!(api.cache().revision("items"), 0);
    assert_eq!(mock.reads(), 1);
}

#[tokio::test]
async fn failed_refetch_keeps_last_data() {
    let (mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items"));
    binding.settled().await;
    let mut rx = binding.subscribe();

    mock.fail_next_read(DataError::transport("connection reset"));
    api.invalidate("items");
    let failed = until(&mut rx, |s| s.is_error()).await;
    assert!(failed.error.as_ref().unwrap().is_transport());
    assert_eq!(failed.data.len(), 2);

    api.invalidate("items");
    let recovered = until(&mut rx, |s| s.is_success()).await;
    assert!(recovered.error.is_none());
}

#[tokio::test]
async fn bindings_on_one_key_share_a_read() {
    let (mock, api) = setup();
    mock.push_read_delay(Duration::from_millis(30));
    let a = api.query::<Item>(QuerySpec::new("items").eq("qty", 5));
    let b = api.query::<Item>(QuerySpec::new("items").eq("qty", 5));
    let (ra, rb) = tokio::join!(a.settled(), b.settled());
    assert_eq!(*ra.data, *rb.data);
    assert_eq!(mock.reads(), 1);
}

#[tokio::test]
async fn invalid_spec_resolves_to_error_without_reading() {
    let (mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new(" "));
    let settled = binding.settled().await;
    assert_eq!(settled.status, QueryStatus::Error);
    assert_eq!(settled.error.unwrap().code(), Some("invalid_query"));
    assert_eq!(mock.reads(), 0);
}

#[tokio::test]
async fn undecodable_rows_surface_as_decode_error() {
    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Priced {
        id: i64,
        price: f64,
    }
    let (_mock, api) = setup();
    let binding = api.query::<Priced>(QuerySpec::new("items"));
    let settled = binding.settled().await;
    assert_eq!(settled.error.map(|e| e.kind()), Some("decode"));
}

#[tokio::test]
async fn update_and_delete_require_id_locally() {
    let (mock, api) = setup();
    let err = api.update::<Item>("items").mutate(&json!({"qty": 1})).await.unwrap_err();
    assert_eq!(err.code(), Some("missing_id"));
    let err = api.delete::<Item>("items").mutate(&json!({"name": "A"})).await.unwrap_err();
    assert_eq!(err.code(), Some("missing_id"));
    assert_eq!(mock.mutations(), 0);

    let err = api.insert::<Item>("items").mutate(&json!([1, 2])).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn delete_of_missing_record_is_not_found() {
    let (_mock, api) = setup();
    let err = api.delete::<Item>("items").mutate(&json!({"id": 42})).await.unwrap_err();
    assert_eq!(err, DataError::not_found("items", "42"));
    assert_eq!(api.cache().revision("items"), 0);
}

#[tokio::test]
async fn batch_reports_partial_failure_and_invalidates_once() {
    let (mock, api) = setup();
    let deletes = api.mutation::<Item>("items", MutationKind::Delete);
    let report = deletes.batch(&[json!({"id": 1}), json!({"id": 99}), json!({"id": 2})]).await;

    assert_eq!(report.len(), 3);
    assert_eq!(
        report.succeeded,
        vec![(0, MutationOutcome::Deleted { id: json!(1) }), (2, MutationOutcome::Deleted { id: json!(2) })]
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 1);
    assert_eq!(report.failed[0].1.kind(), "not_found");
    assert_eq!(api.cache().revision("items"), 1);
    assert!(mock.memory().snapshot("items").unwrap().is_empty());
}

#[tokio::test]
async fn batch_with_bounded_concurrency_keeps_input_order() {
    let mock = Arc::new(MockTable::new());
    let table: Arc<dyn RemoteTable> = mock.clone();
    let api = Collections::with_config(table, ClientConfig::default().with_batch_concurrency(2));
    let names: Vec<Value> = (0..5).map(|i| json!({"name": format!("n{}", i), "qty": i})).collect();
    let report = api.insert::<Item>("items").batch(&names).await;

    assert!(report.is_complete());
    let qtys: Vec<i64> = report.into_result().unwrap().into_iter().filter_map(|o| o.into_record()).map(|i| i.qty).collect();
    assert_eq!(qtys, vec![0, 1, 2, 3, 4]);
    assert_eq!(mock.memory().snapshot("items").unwrap().len(), 5);
}

#[tokio::test]
async fn failed_batch_does_not_invalidate() {
    let (mock, api) = setup();
    mock.fail_next_mutation(DataError::transport("down"));
    let report = api.update::<Item>("items").batch(&[json!({"id": 1, "qty": 3})]).await;
    assert!(report.succeeded.is_empty());
    assert!(report.first_error().unwrap().is_transport());
    assert_eq!(api.cache().revision("items"), 0);
}

#[tokio::test]
async fn timeout_config_turns_slow_reads_into_transport_errors() {
    let mock = Arc::new(MockTable::new());
    mock.push_read_delay(Duration::from_millis(200));
    let table: Arc<dyn RemoteTable> = mock.clone();
    let api = Collections::with_config(table, ClientConfig::default().with_timeout(Duration::from_millis(20)));
    let binding = api.query::<Item>(QuerySpec::new("items"));
    let settled = binding.settled().await;
    assert!(settled.error.unwrap().is_transport());
}

#[tokio::test]
async fn one_shot_fetch_goes_through_the_cache() {
    let (mock, api) = setup();
    let spec = QuerySpec::new("items").order_by("qty", false).limit(1);
    let rows: Vec<Item> = api.fetch(&spec).await.unwrap();
    assert_eq!(rows, vec![item(1, "A", 5)]);
    let again: Vec<Item> = api.fetch(&spec).await.unwrap();
    assert_eq!(again, rows);
    assert_eq!(mock.reads(), 1);
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Priced {
    id: i64,
    name: String,
    price: f64,
}

#[tokio::test]
async fn accepted_mutation_invalidates_even_when_result_does_not_decode() {
    let (mock, api) = setup();
    let binding = api.query::<Item>(QuerySpec::new("items"));
    assert_eq!(binding.settled().await.data.len(), 2);
    let mut rx = binding.subscribe();

    let err = api.insert::<Priced>("items").mutate(&json!({"name": "C", "qty": 10})).await.unwrap_err();
    assert_eq!(err.kind(), "decode");
    assert_eq!(mock.memory().snapshot("items").unwrap().len(), 3);
    assert_eq!(api.cache().revision("items"), 1);
    let after = until(&mut rx, |s| s.is_success() && s.data.len() == 3).await;
    assert_eq!(after.data[2], item(3, "C", 10));

    let report = api.update::<Priced>("items").batch(&[json!({"id": 1, "qty": 8})]).await;
    assert!(report.succeeded.is_empty());
    assert_eq!(report.first_error().unwrap().kind(), "decode");
    assert_eq!(api.cache().revision("items"), 2);
    let after = until(&mut rx, |s| s.is_success() && s.data[0].qty == 8).await;
    assert_eq!(after.data[0], item(1, "A", 8));
}

#[tokio::test]
async fn dropping_a_binding_cancels_its_fetch() {
    let (mock, api) = setup();
    mock.push_read_delay(Duration::from_millis(50));
    let spec = QuerySpec::new("items");
    let binding = api.query::<Item>(spec.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mock.reads(), 1);

    drop(binding);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(api.cache().peek(&spec).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spec_changes_settle_on_the_latest_spec() {
    let (_mock, api) = setup();
    let binding = Arc::new(api.query::<Item>(QuerySpec::new("items")));
    let churn = {
        let binding = binding.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                let qty = if i % 2 == 0 { 0 } else { 5 };
                binding.set_spec(QuerySpec::new("items").eq("qty", qty));
                tokio::task::yield_now().await;
            }
        })
    };
    let invalidations = {
        let api = api.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                api.invalidate("items");
                tokio::task::yield_now().await;
            }
        })
    };
    churn.await.unwrap();
    invalidations.await.unwrap();

    let gen = binding.generation();
    let settled = tokio::time::timeout(Duration::from_secs(2), binding.settled_after(gen)).await.unwrap();
    assert_eq!(binding.spec(), QuerySpec::new("items").eq("qty", 5));
    assert!(settled.is_success());
    assert_eq!(*settled.data, vec![item(1, "A", 5)]);
}
