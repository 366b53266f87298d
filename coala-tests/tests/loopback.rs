//! Two endpoints over real UDP sockets on the loopback interface

mod common;

use bytes::Bytes;
use coala::{Endpoint, EndpointConfig};
use coala_protocol::{Message, MessageCode, OptionNumber};
use common::{fast_config, payload};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

fn loopback_endpoint() -> Endpoint {
    let config = EndpointConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..fast_config()
    };
    let endpoint = Endpoint::bind(config).expect("bind loopback");
    endpoint.start().expect("endpoint starts");
    endpoint
}

#[test]
fn test_loopback_upload_and_download() {
    let client = loopback_endpoint();
    let server = loopback_endpoint();
    let server_addr = server.local_addr().unwrap();
    let upload = payload(4000);
    let download = payload(2500);

    thread::scope(|s| {
        let reply = download.clone();
        let server = &server;
        let served = s.spawn(move || {
            let inbound = server.inbound();
            let mut handled = Vec::new();
            while handled.len() < 2 {
                let message = inbound
                    .recv_timeout(Duration::from_secs(10))
                    .expect("request arrives");
                if !message.is_request() && !message.has_option(OptionNumber::Block1) {
                    continue;
                }
                let body = if message.path() == "/download" {
                    reply.clone()
                } else {
                    Bytes::from("stored")
                };
                server
                    .respond(&message, MessageCode::Content, Some(body))
                    .unwrap();
                handled.push(message);
            }
            handled
        });

        let mut post = Message::request(MessageCode::Post, server_addr);
        post.set_path("/upload");
        post.set_payload(upload.clone());
        let stored = client
            .request(post)
            .unwrap()
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert_eq!(stored.payload, Some(Bytes::from("stored")));

        let mut get = Message::request(MessageCode::Get, server_addr);
        get.set_path("/download");
        let fetched = client
            .request(get)
            .unwrap()
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.payload, Some(download.clone()));

        let handled = served.join().unwrap();
        assert_eq!(handled[0].payload, Some(upload.clone()));
    });

    client.stop();
    server.stop();
}
