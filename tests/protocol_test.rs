use meshrun::protocol::wire::{HeartbeatRequest, HeartbeatResponse, RegisterResponse};
use meshrun::protocol::{
    Batch, PeerMessage, RelayEnvelope, RoutedTaskId, Signal, TagGenerator, TaskUid, WorkerId,
};
use serde_json::json;
use std::collections::BTreeMap;

#[test]
fn test_routed_id_splits_at_last_separator() {
    let routed: RoutedTaskId = "T1~T2~W2".parse().unwrap();
    assert_eq!(routed.task, TaskUid::new("T1~T2"));
    assert_eq!(routed.worker, WorkerId::new("W2"));
    assert_eq!(routed.to_string(), "T1~T2~W2");

    let moved = routed.rerouted(WorkerId::new("W3"));
    assert_eq!(moved.to_string(), "T1~T2~W3");
    assert_eq!(TaskUid::new("T9").on(&WorkerId::new("W1")).to_string(), "T9~W1");
}

#[test]
fn test_routed_id_rejects_malformed() {
    for bad in ["", "no-separator", "~W1", "T1~"] {
        assert!(bad.parse::<RoutedTaskId>().is_err(), "accepted {:?}", bad);
    }
    assert!(serde_json::from_value::<RoutedTaskId>(json!("missing")).is_err());
}

#[test]
fn test_batch_wire_shape() {
    let mut messages = BTreeMap::new();
    messages.insert("T2~W2".parse::<RoutedTaskId>().unwrap(), vec![json!("5"), json!(6)]);
    let message = PeerMessage::Batch(Batch {
        messages,
        tag: 1700000000000,
        id: WorkerId::new("W1"),
    });

    let encoded = serde_json::to_value(&message).unwrap();
    assert_eq!(
        encoded,
        json!({"messages": {"T2~W2": ["5", 6]}, "tag": 1700000000000u64, "id": "W1"})
    );
    assert_eq!(serde_json::from_value::<PeerMessage>(encoded).unwrap(), message);
}

#[test]
fn test_batch_with_invalid_route_still_parses() {
    let message: PeerMessage = serde_json::from_value(json!({
        "messages": {"T2~W2": [1], "no-separator": [2, 3]},
        "tag": 12,
        "id": "W1"
    }))
    .unwrap();

    let PeerMessage::Batch(batch) = message else {
        panic!("expected a batch");
    };
    assert_eq!(batch.tag, 12);
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(
        batch.messages.get(&"T2~W2".parse::<RoutedTaskId>().unwrap()),
        Some(&vec![json!(1)])
    );
}

#[test]
fn test_ack_wire_shape() {
    let ack: PeerMessage = serde_json::from_str(r#"{"ack": 42}"#).unwrap();
    assert_eq!(ack, PeerMessage::Ack { ack: 42 });
    assert_eq!(serde_json::to_string(&ack).unwrap(), r#"{"ack":42}"#);
}

#[test]
fn test_relay_envelope_shapes() {
    let register = RelayEnvelope::Register { id: WorkerId::new("W1") };
    assert_eq!(
        serde_json::to_value(&register).unwrap(),
        json!({"type": "register", "id": "W1"})
    );

    let offer = RelayEnvelope::Signal {
        id: WorkerId::new("W2"),
        dest: WorkerId::new("W1"),
        data: Signal::Offer {
            addr: "127.0.0.1:7000".parse().unwrap(),
        },
    };
    assert_eq!(
        serde_json::to_value(&offer).unwrap(),
        json!({"type": "signal", "id": "W2", "dest": "W1",
               "data": {"kind": "offer", "addr": "127.0.0.1:7000"}})
    );

    // Relayed peer messages nest the batch unchanged
    let relayed: RelayEnvelope = serde_json::from_value(json!({
        "type": "message", "id": "W2", "dest": "W1",
        "data": {"messages": {"T1~W1": [1]}, "tag": 3, "id": "W2"}
    }))
    .unwrap();
    match relayed {
        RelayEnvelope::Message {
            data: PeerMessage::Batch(batch),
            ..
        } => {
            assert_eq!(batch.tag, 3);
            assert_eq!(batch.messages.len(), 1);
        }
        other => panic!("unexpected envelope: {:?}", other),
    }
}

#[test]
fn test_scheduler_messages() {
    let request = HeartbeatRequest {
        worker_id: WorkerId::new("W1"),
        active_tasks: vec![TaskUid::new("T1")],
        n_cores: 4,
    };
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        json!({"worker_id": "W1", "active_tasks": ["T1"], "n_cores": 4})
    );

    let response: HeartbeatResponse = serde_json::from_value(json!({
        "new_tasks": [
            {"task_id": "T1", "contacts": ["T2~W2"]},
            {"task_id": "T3", "program": "double", "params": {"k": 1}}
        ]
    }))
    .unwrap();
    assert_eq!(response.new_tasks.len(), 2);
    assert_eq!(response.new_tasks[0].contacts[0].worker, WorkerId::new("W2"));
    assert!(response.new_tasks[1].contacts.is_empty());
    assert_eq!(response.new_tasks[1].program.as_deref(), Some("double"));

    let empty: HeartbeatResponse = serde_json::from_str("{}").unwrap();
    assert!(empty.new_tasks.is_empty());

    let registered: RegisterResponse = serde_json::from_str("{}").unwrap();
    assert!(registered.success);
    assert!(registered.worker_id.is_none());
}

#[test]
fn test_tags_strictly_increase() {
    let mut tags = TagGenerator::new();
    let mut last = tags.next_tag();
    for _ in 0..1000 {
        let next = tags.next_tag();
        assert!(next > last);
        last = next;
    }
}
