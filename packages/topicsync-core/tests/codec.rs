use chrono::{TimeZone, Utc};
use topicsync_core::{
    AwarenessState, AwarenessUpdate, Envelope, MessageKind, ResyncRequest, ResyncResponse,
};
use topicsync_test_support::{create_app, create_topic, replica, tree};

#[test]
fn operations_survive_the_wire() {
    let mut a = tree("a");
    let (app, c1) = create_app(&mut a, "Nav");
    let (_, c2) = create_topic(&mut a, &app, "pose");

    let text = Envelope::operations(a.replica_id(), &[c1, c2])
        .unwrap()
        .encode()
        .unwrap();
    let envelope = Envelope::decode(&text).unwrap();
    assert_eq!(envelope.kind, MessageKind::Op);
    assert_eq!(&envelope.sender, a.replica_id());

    let batch = envelope.decode_operations().unwrap();
    assert_eq!(batch.dropped, 0);
    let mut b = tree("b");
    b.apply_remote_batch(batch.operations);
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn resync_messages_carry_state_vectors() {
    let mut hub = tree("hub");
    create_app(&mut hub, "Nav");
    let client = tree("client");

    let request = Envelope::resync_request(client.replica_id(), &client.resync_request())
        .unwrap()
        .encode()
        .unwrap();
    let request: ResyncRequest = Envelope::decode(&request).unwrap().payload_as().unwrap();
    assert!(request.is_bootstrap());

    let response = hub.answer_resync(&request).unwrap();
    let text = Envelope::resync_response(hub.replica_id(), &response)
        .unwrap()
        .encode()
        .unwrap();
    let decoded = Envelope::decode(&text).unwrap();
    assert_eq!(decoded.kind, MessageKind::ResyncResponse);
    let decoded: ResyncResponse = decoded.payload_as().unwrap();
    assert_eq!(decoded, response);
}

#[test]
fn awareness_round_trips_with_removal() {
    let me = replica("me");
    let seen = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let update = AwarenessUpdate {
        replica: me.clone(),
        state: Some(AwarenessState::new(me.clone(), seen).with_display_name("Ada")),
    };
    let text = Envelope::awareness(&me, &update).unwrap().encode().unwrap();
    let decoded: AwarenessUpdate = Envelope::decode(&text).unwrap().payload_as().unwrap();
    assert_eq!(decoded, update);

    let leave = AwarenessUpdate {
        replica: me.clone(),
        state: None,
    };
    let text = Envelope::awareness(&me, &leave).unwrap().encode().unwrap();
    assert!(text.contains(r#""state":null"#));
}

#[test]
fn one_bad_operation_does_not_spoil_the_batch() {
    let text = r#"{
        "type": "op",
        "sender": "61",
        "payload": [
            {"meta": {"id": {"replica": "61", "counter": 1}, "lamport": 1},
             "kind": {"op": "create", "node": {"clock": 1, "replica": "61"},
                      "kind": "application", "parent": {"clock": 0, "replica": ""},
                      "attributes": [["name", "Nav"]]}},
            {"meta": {"id": {"replica": "61", "counter": 2}, "lamport": 2},
             "kind": {"op": "create", "node": {"clock": 2, "replica": "61"},
                      "kind": "gadget", "parent": {"clock": 1, "replica": "61"},
                      "attributes": []}},
            {"meta": {"id": {"replica": "zz", "counter": 3}, "lamport": 3},
             "kind": {"op": "delete", "node": {"clock": 1, "replica": "61"}}}
        ]
    }"#;
    let batch = Envelope::decode(text).unwrap().decode_operations().unwrap();
    assert_eq!(batch.operations.len(), 1);
    assert_eq!(batch.dropped, 2);

    let mut b = tree("b");
    b.apply_remote_batch(batch.operations);
    assert_eq!(b.snapshot().application_names(), vec!["Nav"]);
}
