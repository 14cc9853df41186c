// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request/reply round trips through the full stack over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::timeout;

use stonerpc::message::{MessageHeader, RpcMessage};
use stonerpc::network::{
    ConnectionOrientedNetwork, NetworkOptions, ReplyMatcher, RpcEngine, TcpServer,
    TcpTransportProvider,
};
use stonerpc::utils::TokioScheduler;
use stonerpc::{setup_tracing, AppResult};

/// Server-side engine: echoes every request's payload back as a reply on the
/// session it arrived on.
struct EchoEngine {
    matcher: Arc<NullMatcher>,
}

struct NullMatcher;

impl ReplyMatcher for NullMatcher {
    fn on_recv_reply(&self, _id: u64, _reply: Option<Arc<RpcMessage>>, _delay_ms: u64) {}
}

impl RpcEngine for EchoEngine {
    fn primary_address(&self) -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    fn matcher(&self) -> Arc<dyn ReplyMatcher> {
        self.matcher.clone()
    }

    fn on_recv_request(
        &self,
        _net: &Arc<ConnectionOrientedNetwork>,
        msg: Arc<RpcMessage>,
        _delay_ms: u64,
    ) {
        let session = msg.session().expect("inbound request carries its session");
        let reply = RpcMessage::new(
            MessageHeader::reply(msg.header.id),
            msg.header.from_address,
            msg.payload.clone(),
        );
        session.send_message(Arc::new(reply));
    }
}

/// Client-side engine: forwards every matched reply into a channel the test
/// can await.
struct ClientEngine {
    matcher: Arc<ChannelMatcher>,
}

struct ChannelMatcher {
    replies: UnboundedSender<(u64, Option<Arc<RpcMessage>>)>,
}

impl ReplyMatcher for ChannelMatcher {
    fn on_recv_reply(&self, id: u64, reply: Option<Arc<RpcMessage>>, _delay_ms: u64) {
        let _ = self.replies.send((id, reply));
    }
}

impl RpcEngine for ClientEngine {
    fn primary_address(&self) -> SocketAddr {
        "127.0.0.1:2".parse().unwrap()
    }

    fn matcher(&self) -> Arc<dyn ReplyMatcher> {
        self.matcher.clone()
    }

    fn on_recv_request(
        &self,
        _net: &Arc<ConnectionOrientedNetwork>,
        _msg: Arc<RpcMessage>,
        _delay_ms: u64,
    ) {
        unreachable!("the client side of this test never serves requests");
    }
}

async fn start_echo_server(
    notify_shutdown: broadcast::Sender<()>,
) -> AppResult<(SocketAddr, Arc<ConnectionOrientedNetwork>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;

    let engine = Arc::new(EchoEngine {
        matcher: Arc::new(NullMatcher),
    });
    let net = ConnectionOrientedNetwork::new(
        engine,
        TcpTransportProvider::new(),
        NetworkOptions {
            address: server_addr,
            ..Default::default()
        },
        Arc::new(TokioScheduler::new()),
    );

    let server = TcpServer::new(listener, net.clone(), 16, notify_shutdown);
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            panic!("tcp server failed: {}", e);
        }
    });
    Ok((server_addr, net))
}

async fn wait_for_sent(session: &Arc<stonerpc::RpcSession>, expected: u64) {
    timeout(Duration::from_secs(5), async {
        while session.message_sent() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("send completions did not arrive");
    assert_eq!(session.message_sent(), expected);
}

fn start_client() -> (
    Arc<ConnectionOrientedNetwork>,
    mpsc::UnboundedReceiver<(u64, Option<Arc<RpcMessage>>)>,
) {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(ClientEngine {
        matcher: Arc::new(ChannelMatcher { replies: reply_tx }),
    });
    let net = ConnectionOrientedNetwork::new(
        engine,
        TcpTransportProvider::new(),
        NetworkOptions::default(),
        Arc::new(TokioScheduler::new()),
    );
    (net, reply_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_request_reply_round_trip() -> AppResult<()> {
    let _ = setup_tracing();

    let (notify_shutdown, _) = broadcast::channel(1);
    let (server_addr, _server_net) = start_echo_server(notify_shutdown.clone()).await?;
    let (client_net, mut replies) = start_client();

    let request = Arc::new(RpcMessage::new(
        MessageHeader::request(7),
        Some(server_addr),
        vec![Bytes::from_static(b"ping")],
    ));
    client_net.send_message(request);

    let (id, reply) = timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("reply channel closed");
    assert_eq!(id, 7);
    let reply = reply.expect("round trip must produce a real reply");
    assert!(!reply.is_request());
    assert_eq!(reply.payload.len(), 1);
    assert_eq!(&reply.payload[0][..], b"ping");

    // the client session is connected and accounted for; the completion
    // callback may still be racing the reply, so wait for it
    let session = client_net.get_client_session(server_addr).unwrap();
    wait_for_sent(&session, 1).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_requests_one_session() -> AppResult<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (server_addr, _server_net) = start_echo_server(notify_shutdown.clone()).await?;
    let (client_net, mut replies) = start_client();

    let total = 64u64;
    for id in 1..=total {
        let request = Arc::new(RpcMessage::new(
            MessageHeader::request(id),
            Some(server_addr),
            vec![Bytes::from(format!("payload-{}", id))],
        ));
        client_net.send_message(request);
    }

    let mut seen = Vec::new();
    for _ in 0..total {
        let (id, reply) = timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("timed out waiting for replies")
            .expect("reply channel closed");
        assert!(reply.is_some());
        seen.push(id);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=total).collect::<Vec<_>>());

    // everything went down one client session
    let session = client_net.get_client_session(server_addr).unwrap();
    wait_for_sent(&session, total).await;
    assert!(!session.has_pending_out_msgs());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acceptor_stops_on_shutdown_signal() -> AppResult<()> {
    let (notify_shutdown, _) = broadcast::channel(1);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;
    let engine = Arc::new(EchoEngine {
        matcher: Arc::new(NullMatcher),
    });
    let net = ConnectionOrientedNetwork::new(
        engine,
        TcpTransportProvider::new(),
        NetworkOptions {
            address: server_addr,
            ..Default::default()
        },
        Arc::new(TokioScheduler::new()),
    );
    let server = TcpServer::new(listener, net, 4, notify_shutdown.clone());
    let handle = tokio::spawn(async move { server.run().await });

    notify_shutdown.send(()).expect("acceptor is subscribed");
    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("acceptor did not stop")
        .expect("acceptor task panicked");
    assert!(result.is_ok());
    Ok(())
}
