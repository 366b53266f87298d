//! Endpoints exchanging datagrams over an in-memory network

mod common;

use bytes::Bytes;
use coala::{Endpoint, FailureReason};
use coala_protocol::{Message, MessageCode, OptionNumber, Token};
use common::{addr, endpoint, payload, MemoryNet};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Answer the first request or upload `server` receives
fn serve_one(server: &Endpoint, code: MessageCode, reply: Bytes) -> Message {
    let inbound = server.inbound();
    loop {
        let message = inbound.recv_timeout(WAIT).expect("request arrives");
        if message.is_request() || message.has_option(OptionNumber::Block1) {
            server
                .respond(&message, code, Some(reply))
                .expect("response queued");
            return message;
        }
    }
}

fn post(to: std::net::SocketAddr, size: usize) -> Message {
    let mut request = Message::request(MessageCode::Post, to);
    request.token = Some(Token::random());
    request.set_path("/upload");
    request.set_payload(payload(size));
    request
}

#[test]
fn test_small_request_answered() {
    let net = MemoryNet::new();
    let client = endpoint(&net, addr(1));
    let server = endpoint(&net, addr(2));

    let mut request = Message::request(MessageCode::Get, addr(2));
    request.set_path("/ping");

    thread::scope(|s| {
        let served = s.spawn(|| serve_one(&server, MessageCode::Content, Bytes::from("pong")));
        let outcome = client.request(request).unwrap();
        let response = outcome.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(response.code, MessageCode::Content);
        assert_eq!(response.payload, Some(Bytes::from("pong")));
        assert_eq!(served.join().unwrap().path(), "/ping");
    });

    client.stop();
    server.stop();
}

#[test]
fn test_upload_in_blocks() {
    let net = MemoryNet::new();
    let client = endpoint(&net, addr(1));
    let server = endpoint(&net, addr(2));
    let request = post(addr(2), 5000);
    let token = request.token.clone().unwrap();

    thread::scope(|s| {
        let served = s.spawn(|| serve_one(&server, MessageCode::Changed, Bytes::from("stored")));
        let outcome = client.request(request.clone()).unwrap();
        let response = outcome.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(response.code, MessageCode::Changed);
        assert_eq!(response.payload, Some(Bytes::from("stored")));

        let upload = served.join().unwrap();
        assert_eq!(upload.payload, request.payload);
        assert_eq!(upload.token, request.token);
    });

    let transfer = client.delivery_info(&token).unwrap().transfer.unwrap();
    assert_eq!(transfer.messages, 5);
    assert_eq!(transfer.data_size, 5000);
    assert!(!transfer.incoming);

    client.stop();
    server.stop();
}

#[test]
fn test_upload_survives_loss() {
    let net = MemoryNet::new();
    net.drop_every(7);
    let client = endpoint(&net, addr(1));
    let server = endpoint(&net, addr(2));
    let request = post(addr(2), 8000);

    thread::scope(|s| {
        let served = s.spawn(|| serve_one(&server, MessageCode::Changed, Bytes::from("stored")));
        let outcome = client.request(request.clone()).unwrap();
        let response = outcome.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(response.code, MessageCode::Changed);
        assert_eq!(served.join().unwrap().payload, request.payload);
    });

    assert!(net.dropped() > 0);
    client.stop();
    server.stop();
}

#[test]
fn test_large_piggybacked_response() {
    let net = MemoryNet::new();
    let client = endpoint(&net, addr(1));
    let server = endpoint(&net, addr(2));
    let body = payload(3000);

    let mut request = Message::request(MessageCode::Get, addr(2));
    request.set_path("/firmware");

    thread::scope(|s| {
        let reply = body.clone();
        let served = s.spawn(|| serve_one(&server, MessageCode::Content, reply));
        let outcome = client.request(request).unwrap();
        let response = outcome.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(response.code, MessageCode::Content);
        assert_eq!(response.payload, Some(body.clone()));
        served.join().unwrap();
    });

    client.stop();
    server.stop();
}

#[test]
fn test_unreachable_peer_fails_transfer() {
    let net = MemoryNet::new();
    let client = endpoint(&net, addr(1));
    let request = post(addr(9), 3000);

    let outcome = client.request(request).unwrap();
    let failure = outcome.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(failure.reason, FailureReason::TransferFailed);
    let transfer = failure.delivery.and_then(|info| info.transfer).unwrap();
    assert_eq!(transfer.data_size, 3000);
    assert!(transfer.resends > 0);

    client.stop();
}

#[test]
fn test_stop_fails_pending_requests() {
    let net = MemoryNet::new();
    let client = endpoint(&net, addr(1));
    let request = Message::request(MessageCode::Get, addr(9));

    let outcome = client.request(request).unwrap();
    client.stop();
    let failure = outcome.recv_timeout(WAIT).unwrap().unwrap_err();
    assert_eq!(failure.reason, FailureReason::Stopped("Coala stopped".to_string()));
    assert!(!client.is_running());
    assert_eq!(client.pending(), 0);
}
