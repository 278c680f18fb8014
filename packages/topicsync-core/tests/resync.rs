use topicsync_core::{NodeId, ResyncRequest};
use topicsync_test_support::{create_app, create_topic, tree};

#[test]
fn reconnect_receives_exactly_the_missing_operations() {
    let mut hub = tree("hub");
    let mut client = tree("client");

    // N operations both sides have seen
    let (app, op) = create_app(&mut hub, "Nav");
    client.apply_remote(op).unwrap();
    let (_, op) = create_topic(&mut hub, &app, "pose");
    client.apply_remote(op).unwrap();

    // client goes offline; M operations happen elsewhere
    let m = 5;
    for i in 0..m {
        hub.set_attributes(&app, [("description", format!("rev {i}"))])
            .unwrap();
    }

    let response = hub.answer_resync(&client.resync_request()).unwrap();
    assert!(!response.bootstrap);
    assert_eq!(response.operations.len(), m);

    let outcome = client.apply_resync(response).unwrap();
    assert_eq!(outcome.delta.applied, m);
    assert!(outcome.push_back.is_empty());
    assert_eq!(client.snapshot(), hub.snapshot());
}

#[test]
fn offline_edits_are_pushed_back() {
    let mut hub = tree("hub");
    let mut client = tree("client");
    let (app, op) = create_app(&mut hub, "Nav");
    client.apply_remote(op).unwrap();

    client
        .set_attributes(&app, [("description", "offline")])
        .unwrap();
    create_topic(&mut client, &app, "scan");
    hub.set_attributes(&app, [("name", "Navigation")]).unwrap();

    let response = hub.answer_resync(&client.resync_request()).unwrap();
    let outcome = client.apply_resync(response).unwrap();
    assert_eq!(outcome.push_back.len(), 2);

    hub.apply_remote_batch(outcome.push_back);
    assert_eq!(client.snapshot(), hub.snapshot());
    assert!(hub.state_vector().is_aware_of(client.state_vector()));
    assert!(client.state_vector().is_aware_of(hub.state_vector()));
}

#[test]
fn first_connection_bootstraps_from_compacted_history() {
    let mut hub = tree("hub");
    let (app, _) = create_app(&mut hub, "Nav");
    hub.set_attributes(&app, [("description", "d1")]).unwrap();
    hub.set_attributes(&app, [("proto", "p1")]).unwrap();
    hub.set_attributes(&app, [("description", "d2")]).unwrap();
    hub.set_attributes(&app, [("description", "d3")]).unwrap();
    let (topic, _) = create_topic(&mut hub, &app, "pose");
    hub.delete_node(&topic).unwrap();
    hub.delete_node(&topic).unwrap();

    let mut fresh = tree("fresh");
    let response = hub.answer_resync(&ResyncRequest::bootstrap()).unwrap();
    assert!(response.bootstrap);
    // create app, d1 (introduces key), p1, d3, create topic, one delete
    assert_eq!(response.operations.len(), 6);
    assert!(response.operations.len() < hub.operations().unwrap().len());

    fresh.apply_resync(response).unwrap();
    assert_eq!(fresh.snapshot(), hub.snapshot());
    let keys: Vec<String> = fresh
        .attributes(&app)
        .unwrap()
        .iter()
        .map(|(k, _)| k.to_string())
        .collect();
    assert_eq!(keys, vec!["name", "description", "proto"]);
    assert!(fresh.is_tombstoned(&topic));

    // a later incremental resync sends nothing old
    hub.create_node(
        &NodeId::ROOT,
        topicsync_core::NodeKind::Application,
        vec![("name".into(), "Radar".into())],
    )
    .unwrap();
    let response = hub.answer_resync(&fresh.resync_request()).unwrap();
    assert_eq!(response.operations.len(), 1);
}

#[test]
fn resync_is_idempotent() {
    let mut hub = tree("hub");
    create_app(&mut hub, "Nav");
    let mut client = tree("client");

    let response = hub.answer_resync(&client.resync_request()).unwrap();
    client.apply_resync(response.clone()).unwrap();
    let before = client.snapshot();
    let outcome = client.apply_resync(response).unwrap();
    assert_eq!(outcome.delta.duplicates, 1);
    assert_eq!(client.snapshot(), before);
}
