use proto::{ExchangeEvent, Frame, GatewayId, GatewayStatus, IotMessage};

#[test]
fn gateway_frame_json_contract() {
    let raw = br#"{
        "gatewayId": "gw42",
        "deviceId": "sensor-7",
        "messageType": "status",
        "name": "device",
        "value": "on",
        "timestamp": "2024-05-01T10:00:00Z"
    }"#;

    let msg = IotMessage::from_slice(raw).expect("gateway frame should decode");
    assert_eq!(msg.gateway_id, GatewayId::from("gw42"));
    assert_eq!(msg.device_id.as_deref(), Some("sensor-7"));
    assert_eq!(msg.status_value(), Some(GatewayStatus::Online));
    assert!(msg.timestamp.is_some());

    let encoded = msg.to_vec().expect("encode");
    let decoded = IotMessage::from_slice(&encoded).expect("re-decode");
    assert_eq!(decoded, msg);
}

#[test]
fn rpc_frame_targets_gateway_inbound_queue() {
    let gateway = GatewayId::from("gw42");
    let request = IotMessage::new(gateway.clone(), "command");
    let frame = Frame::new(request.to_vec().expect("encode"))
        .with_rpc("corr-1", gateway.inbound_queue());

    assert_eq!(frame.reply_to.as_deref(), Some("gw42.in"));

    // The event announcing that same queue attaches the gateway.
    let event = ExchangeEvent::created(frame.reply_to.clone().unwrap_or_default());
    assert_eq!(event.target(), Some(gateway));
}
