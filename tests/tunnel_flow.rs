//! End-to-end tunnel tests
//!
//! A client and a relay in one process: datagrams written by the client's
//! WireGuard stand-in must come out of the relay's, and back.


use integration_harness::{recv, relay_config, start_client, start_relay};
use morph_client::ClientEvent;
use morph_protocol::TEMPLATE_IDS;

/// WireGuard handshake initiation sized payload
fn initiation() -> Vec<u8> {
    let mut packet = vec![0u8; 148];
    packet[0] = 0x01;
    for (i, b) in packet.iter_mut().enumerate().skip(4) {
        *b = (i * 7) as u8;
    }
    packet
}

#[tokio::test]
async fn test_round_trip_through_relay() {
    let relay = start_relay(relay_config()).await;
    let mut client = start_client(relay.addr, 2).await;

    let ClientEvent::Connected { port } = client.next_event().await else {
        panic!("expected connected event");
    };

    // Client WireGuard -> relay WireGuard
    client
        .wireguard
        .send_to(&initiation(), client.addr)
        .await
        .unwrap();
    let (packet, session_addr) = recv(&relay.wireguard).await;
    assert_eq!(packet, initiation());
    assert_eq!(session_addr.port(), port);

    // Relay WireGuard answers the session socket it heard from
    let response = vec![0x02; 92];
    relay
        .wireguard
        .send_to(&response, session_addr)
        .await
        .unwrap();
    let (packet, _) = recv(&client.wireguard).await;
    assert_eq!(packet, response);

    assert_eq!(client.shutdown().await, Ok(()));
}

#[tokio::test]
async fn test_every_template_carries_traffic() {
    let relay = start_relay(relay_config()).await;

    for template_id in TEMPLATE_IDS {
        let mut client = start_client(relay.addr, template_id).await;
        assert!(matches!(
            client.next_event().await,
            ClientEvent::Connected { .. }
        ));

        let payload = format!("payload over template {}", template_id).into_bytes();
        client
            .wireguard
            .send_to(&payload, client.addr)
            .await
            .unwrap();
        let (packet, _) = recv(&relay.wireguard).await;
        assert_eq!(packet, payload, "template {}", template_id);

        assert_eq!(client.shutdown().await, Ok(()));
    }
}

#[tokio::test]
async fn test_round_trip_without_packet_security() {
    let mut config = relay_config();
    config.security.packet_security = false;
    let relay = start_relay(config).await;
    let mut client = start_client(relay.addr, 8).await;

    assert!(matches!(
        client.next_event().await,
        ClientEvent::Connected { .. }
    ));

    let large = (0..1420).map(|i| (i % 253) as u8).collect::<Vec<_>>();
    client.wireguard.send_to(&large, client.addr).await.unwrap();
    let (packet, session_addr) = recv(&relay.wireguard).await;
    assert_eq!(packet, large);

    relay.wireguard.send_to(b"ack", session_addr).await.unwrap();
    let (packet, _) = recv(&client.wireguard).await;
    assert_eq!(packet, b"ack");

    assert_eq!(client.shutdown().await, Ok(()));
}
