mod common;

use anycast_plane::error::Fault;
use anycast_plane::handler::OutputHandler;
use anycast_plane::identity::NodeId;
use anycast_plane::store::stream::{StreamHandle, StreamKind};
use common::{link, Harness};

#[tokio::test]
async fn no_topology_answer_routes_on_an_unresolved_guess() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");

    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");

    let OutputHandler::Link(handler) = handler else {
        panic!("expected a link handler");
    };
    assert_eq!(handler.node(), None);
    assert!(handler.is_guess());
    assert_eq!(realization.as_link().expect("link").active_node().await, None);
    assert_eq!(
        h.store
            .streams_of_kind(realization.definition().id, StreamKind::Transmit)
            .len(),
        1
    );
}

#[tokio::test]
async fn placeholder_resolves_in_place_once_the_topology_answers() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");

    // First put routes on the unresolved placeholder.
    realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");

    let node = NodeId::random();
    h.topology.script_link(Some(node));
    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");

    assert_eq!(handler.node(), Some(node));
    let OutputHandler::Link(handler) = handler else {
        panic!("expected a link handler");
    };
    assert!(!handler.is_guess());

    // Resolving reuses the placeholder's stream; queued messages keep their
    // order behind it.
    assert_eq!(
        h.store
            .streams_of_kind(realization.definition().id, StreamKind::Transmit)
            .len(),
        1
    );
}

#[tokio::test]
async fn a_changed_answer_migrates_the_queue_point() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");
    let node_a = NodeId::random();
    let node_b = NodeId::random();

    h.topology.script_link(Some(node_a));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");

    h.topology.script_link(Some(node_b));
    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");
    assert_eq!(handler.node(), Some(node_b));

    let link_state = realization.as_link().expect("link");
    assert_eq!(link_state.active_node().await, Some(node_b));
    assert!(link_state.is_draining(node_a).await);

    let streams = h
        .store
        .streams_of_kind(realization.definition().id, StreamKind::Transmit);
    assert_eq!(streams.len(), 2);
    assert_eq!(
        streams
            .iter()
            .filter(|stream| stream.is_to_be_deleted())
            .count(),
        1
    );
}

#[tokio::test]
async fn moving_back_resurrects_the_draining_queue_point() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");
    let node_a = NodeId::random();
    let node_b = NodeId::random();

    h.topology.script_link(Some(node_a));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose");
    h.topology.script_link(Some(node_b));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose");

    // Back to the first node: its draining stream comes back instead of a
    // third one appearing.
    h.topology.script_link(Some(node_a));
    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");
    assert_eq!(handler.node(), Some(node_a));

    let link_state = realization.as_link().expect("link");
    assert_eq!(link_state.active_node().await, Some(node_a));
    assert!(!link_state.is_draining(node_a).await);
    assert!(link_state.is_draining(node_b).await);

    let streams = h
        .store
        .streams_of_kind(realization.definition().id, StreamKind::Transmit);
    assert_eq!(streams.len(), 2);
}

#[tokio::test]
async fn a_failed_migration_swap_rolls_back_both_marks() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");
    let node_a = NodeId::random();
    let node_b = NodeId::random();

    h.topology.script_link(Some(node_a));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose");
    h.topology.script_link(Some(node_b));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose");

    // Moving back fails while retiring the active stream; the resurrection
    // of the draining one must not survive on its own.
    h.store
        .toggles
        .fail_next_mark
        .store(true, std::sync::atomic::Ordering::SeqCst);
    h.topology.script_link(Some(node_a));
    let err = realization
        .choose_link_output_handler()
        .await
        .expect_err("mark failed");
    assert!(matches!(err, Fault::Resource(_)));

    let link_state = realization.as_link().expect("link");
    assert_eq!(link_state.active_node().await, Some(node_b));
    assert!(link_state.is_draining(node_a).await);
    let streams = h
        .store
        .streams_of_kind(realization.definition().id, StreamKind::Transmit);
    assert_eq!(
        streams
            .iter()
            .filter(|stream| stream.is_to_be_deleted())
            .count(),
        1,
        "the draining stream keeps its mark"
    );

    // A retry completes the move.
    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("retry")
        .expect("a handler");
    assert_eq!(handler.node(), Some(node_a));
    assert!(!link_state.is_draining(node_a).await);
    assert!(link_state.is_draining(node_b).await);
}

#[tokio::test]
async fn a_locally_hosted_link_short_circuits_routing() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");
    realization
        .add_local_localisation(None)
        .await
        .expect("local point");

    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");
    assert!(handler.is_local());
}

#[tokio::test]
async fn a_stale_guess_is_corrected_by_the_next_answer() {
    let h = Harness::new();
    let realization = h
        .fabric
        .create_destination(link("partner-bus"), None)
        .await
        .expect("create");
    let node = NodeId::random();

    h.topology.script_link(Some(node));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose");

    // The topology goes quiet; routing continues on the last known node but
    // flagged as a guess.
    h.topology.script_link(None);
    let handler = realization
        .choose_link_output_handler()
        .await
        .expect("choose")
        .expect("a handler");
    assert_eq!(handler.node(), Some(node));
    let OutputHandler::Link(guessed) = handler else {
        panic!("expected a link handler");
    };
    assert!(guessed.is_guess());

    // The answer returns unchanged; the guess flag clears.
    h.topology.script_link(Some(node));
    realization
        .choose_link_output_handler()
        .await
        .expect("choose");
    assert!(!guessed.is_guess());
}
