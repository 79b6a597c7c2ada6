use std::collections::HashMap;
use std::io;
use std::time::Duration;

use rumqttc::{QoS, SubscribeReasonCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::mqtt::{
    INITIAL_BACKOFF, MAX_BACKOFF, MqttConnector, granted_qos, mqtt_options, next_backoff,
    to_mqtt_qos,
};
use super::testing::{endpoint, within};
use super::{Connector, GrantedQos, Transport, TransportEvent, TransportLink};
use crate::config::{BrokerEndpoint, Qos};

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// What the loopback broker saw from its last client.
#[derive(Debug, Default)]
struct Seen {
    client_id: String,
    keep_alive: u16,
    /// (packet id, filter, requested qos)
    subscribes: Vec<(u16, String, u8)>,
    disconnected: bool,
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok((header >> 4, body))
}

fn string_at(body: &[u8], at: usize) -> (String, usize) {
    let len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
    let text = String::from_utf8(body[at + 2..at + 2 + len].to_vec()).unwrap();
    (text, at + 2 + len)
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);
    let mut packet = vec![0x30, body.len() as u8];
    packet.extend(body);
    packet
}

/// Answers one client: CONNACK, a SUBACK echoing each requested qos (or a
/// failure for the filter `denied/#`), and after `publish_after` subscribes
/// one QoS 0 message on `plant/1/temp`. With `hang_up` the broker closes the
/// socket right after the CONNACK.
async fn serve_client(mut stream: TcpStream, publish_after: usize, hang_up: bool) -> Seen {
    let mut seen = Seen::default();
    while let Ok((kind, body)) = read_packet(&mut stream).await {
        match kind {
            CONNECT => {
                seen.keep_alive = u16::from_be_bytes([body[8], body[9]]);
                seen.client_id = string_at(&body, 10).0;
                stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                if hang_up {
                    return seen;
                }
            }
            SUBSCRIBE => {
                let pkid = u16::from_be_bytes([body[0], body[1]]);
                let (filter, end) = string_at(&body, 2);
                let qos = body[end];
                let code = if filter == "denied/#" { 0x80 } else { qos };
                stream
                    .write_all(&[0x90, 0x03, body[0], body[1], code])
                    .await
                    .unwrap();
                seen.subscribes.push((pkid, filter, qos));
                if seen.subscribes.len() == publish_after {
                    stream
                        .write_all(&publish_packet("plant/1/temp", b"20.5"))
                        .await
                        .unwrap();
                }
            }
            UNSUBSCRIBE => {
                stream
                    .write_all(&[0xB0, 0x02, body[0], body[1]])
                    .await
                    .unwrap();
            }
            PINGREQ => stream.write_all(&[0xD0, 0x00]).await.unwrap(),
            DISCONNECT => {
                seen.disconnected = true;
                break;
            }
            _ => {}
        }
    }
    seen
}

async fn loopback_endpoint() -> (TcpListener, BrokerEndpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut endpoint = endpoint("loopback");
    endpoint.address = "127.0.0.1".to_string();
    endpoint.port = listener.local_addr().unwrap().port();
    (listener, endpoint)
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no transport event in time")
        .expect("transport event channel closed")
}

#[test]
fn test_generated_client_id_fits_mqtt_limit() {
    let options = mqtt_options(&endpoint("local"));
    let id = options.client_id();
    assert!(id.starts_with("mqtt-logger-"));
    assert_eq!(id.len(), 23);
    assert_ne!(id, mqtt_options(&endpoint("local")).client_id());
    assert!(options.clean_session());
    assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
}

#[test]
fn test_options_follow_endpoint_settings() {
    let mut plant = endpoint("plant");
    plant.client_id = Some("plant-logger".to_string());
    plant.keep_alive_secs = 30;
    let options = mqtt_options(&plant);
    assert_eq!(options.client_id(), "plant-logger");
    assert_eq!(options.keep_alive(), Duration::from_secs(30));
    assert_eq!(options.credentials(), None);

    plant.keep_alive_secs = 0;
    assert_eq!(mqtt_options(&plant).keep_alive(), Duration::from_secs(5));

    plant.password = Some("secret".to_string());
    assert_eq!(mqtt_options(&plant).credentials(), None);

    plant.username = Some("logger".to_string());
    assert_eq!(
        mqtt_options(&plant).credentials(),
        Some(("logger".to_string(), "secret".to_string()))
    );

    plant.password = None;
    assert_eq!(
        mqtt_options(&plant).credentials(),
        Some(("logger".to_string(), String::new()))
    );
}

#[test]
fn test_qos_conversions() {
    assert_eq!(to_mqtt_qos(Qos::AtMostOnce), QoS::AtMostOnce);
    assert_eq!(to_mqtt_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
    assert_eq!(to_mqtt_qos(Qos::ExactlyOnce), QoS::ExactlyOnce);

    assert_eq!(
        granted_qos(&SubscribeReasonCode::Success(QoS::AtMostOnce)),
        GrantedQos::Granted(Qos::AtMostOnce)
    );
    assert_eq!(
        granted_qos(&SubscribeReasonCode::Success(QoS::ExactlyOnce)),
        GrantedQos::Granted(Qos::ExactlyOnce)
    );
    assert_eq!(
        granted_qos(&SubscribeReasonCode::Failure),
        GrantedQos::Rejected
    );
}

#[test]
fn test_backoff_doubles_up_to_cap() {
    let mut delay = INITIAL_BACKOFF;
    let mut delays = Vec::new();
    for _ in 0..9 {
        delays.push(delay.as_secs());
        delay = next_backoff(delay);
    }
    assert_eq!(delays, [1, 2, 4, 8, 16, 32, 64, 120, 120]);
    assert_eq!(next_backoff(MAX_BACKOFF), MAX_BACKOFF);
}

#[tokio::test]
async fn test_subscribe_tokens_match_broker_packet_ids() {
    let (listener, mut endpoint) = loopback_endpoint().await;
    endpoint.keep_alive_secs = 1;
    let broker = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        serve_client(stream, 3, false).await
    });

    let TransportLink {
        transport,
        mut events,
    } = MqttConnector::new().start(&endpoint).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected { .. }
    ));

    let (temp, alarms, denied) = tokio::join!(
        transport.subscribe("plant/+/temp", Qos::AtMostOnce),
        transport.subscribe("plant/alarms", Qos::AtLeastOnce),
        transport.subscribe("denied/#", Qos::ExactlyOnce),
    );
    let (temp, alarms, denied) = (temp.unwrap(), alarms.unwrap(), denied.unwrap());
    assert_ne!(temp, alarms);
    assert_ne!(alarms, denied);

    let mut acks = HashMap::new();
    let mut messages = Vec::new();
    while acks.len() < 3 || messages.is_empty() {
        match next_event(&mut events).await {
            TransportEvent::SubscribeAck { token, granted } => {
                acks.insert(token, granted);
            }
            TransportEvent::Message { topic, payload } => messages.push((topic, payload)),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(acks[&temp], [GrantedQos::Granted(Qos::AtMostOnce)]);
    assert_eq!(acks[&alarms], [GrantedQos::Granted(Qos::AtLeastOnce)]);
    assert_eq!(acks[&denied], [GrantedQos::Rejected]);
    assert_eq!(messages, [("plant/1/temp".to_string(), b"20.5".to_vec())]);

    within(transport.disconnect()).await.unwrap();
    let seen = within(broker).await.unwrap();
    assert!(seen.disconnected);
    assert!(seen.client_id.starts_with("mqtt-logger-"));
    assert_eq!(seen.keep_alive, 5);

    let filters: HashMap<u16, (String, u8)> = seen
        .subscribes
        .into_iter()
        .map(|(pkid, filter, qos)| (pkid, (filter, qos)))
        .collect();
    assert_eq!(filters[&temp.0], ("plant/+/temp".to_string(), 0));
    assert_eq!(filters[&alarms.0], ("plant/alarms".to_string(), 1));
    assert_eq!(filters[&denied.0], ("denied/#".to_string(), 2));
}

#[tokio::test]
async fn test_dropped_connection_is_reported_and_retried() {
    let (listener, endpoint) = loopback_endpoint().await;
    let broker = tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        serve_client(first, usize::MAX, true).await;
        let (second, _) = listener.accept().await.unwrap();
        serve_client(second, usize::MAX, false).await
    });

    let TransportLink {
        transport,
        mut events,
    } = MqttConnector::new().start(&endpoint).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Disconnected { .. }
    ));
    // the first retry waits INITIAL_BACKOFF
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Connected { .. }
    ));

    within(transport.disconnect()).await.unwrap();
    assert!(within(broker).await.unwrap().disconnected);
}

#[tokio::test]
async fn test_disconnect_while_unreachable_returns_promptly() {
    let (listener, endpoint) = loopback_endpoint().await;
    drop(listener);

    let TransportLink {
        transport,
        mut events,
    } = MqttConnector::new().start(&endpoint).unwrap();
    // let the first attempt fail and the task settle into its backoff
    tokio::time::sleep(Duration::from_millis(200)).await;

    within(transport.disconnect()).await.unwrap();
    assert_eq!(within(events.recv()).await, None);
}
