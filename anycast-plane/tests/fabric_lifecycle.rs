mod common;

use anycast_plane::error::Fault;
use anycast_plane::store::transaction::Transaction;
use common::{queue, Harness};

#[tokio::test]
async fn destination_becomes_visible_only_on_commit() {
    let h = Harness::new();
    let definition = queue("orders");
    let id = definition.id;

    let txn = h.store.begin_for_test().await;
    h.fabric
        .create_destination(definition, Some(txn.clone()))
        .await
        .expect("create");
    assert!(h.fabric.lookup(id).await.is_none());

    txn.commit().await.expect("commit");
    assert!(h.fabric.lookup(id).await.is_some());
    assert!(h.store.root_exists(id));
}

#[tokio::test]
async fn rolled_back_destination_create_is_a_no_op() {
    let h = Harness::new();
    let definition = queue("orders");
    let id = definition.id;

    let txn = h.store.begin_for_test().await;
    h.fabric
        .create_destination(definition.clone(), Some(txn.clone()))
        .await
        .expect("create");
    txn.rollback().await.expect("rollback");

    assert!(h.fabric.lookup(id).await.is_none());
    assert!(!h.store.root_exists(id));

    // The id is free again; a retry succeeds.
    h.fabric
        .create_destination(definition, None)
        .await
        .expect("retry");
    assert!(h.fabric.lookup(id).await.is_some());
}

#[tokio::test]
async fn duplicate_destination_id_is_rejected() {
    let h = Harness::new();
    let definition = queue("orders");
    h.fabric
        .create_destination(definition.clone(), None)
        .await
        .expect("create");

    let err = h
        .fabric
        .create_destination(definition, None)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, Fault::AlreadyExists(_)));
}

#[tokio::test]
async fn delete_bars_further_child_streams_and_drops_the_entry() {
    let h = Harness::new();
    let definition = queue("orders");
    let id = definition.id;
    let realization = h
        .fabric
        .create_destination(definition, None)
        .await
        .expect("create");

    h.fabric.delete_destination(id, None).await.expect("delete");
    assert!(h.fabric.lookup(id).await.is_none());

    // The realization a caller still holds can no longer grow state.
    let err = realization
        .add_local_localisation(None)
        .await
        .expect_err("barred");
    assert!(matches!(err, Fault::NotFound(_)));
}

#[tokio::test]
async fn deleting_an_unknown_destination_is_not_found() {
    let h = Harness::new();
    let err = h
        .fabric
        .delete_destination(anycast_plane::DestinationId::random(), None)
        .await
        .expect_err("unknown");
    assert!(matches!(err, Fault::NotFound(_)));
}
