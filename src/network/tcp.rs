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

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::network::session::READ_NEXT_DEFAULT;
use crate::network::{ConnectionOrientedNetwork, RpcSession, SessionTransport, TransportProvider};
use crate::{AppError, AppResult};

/// One-shot view of the acceptor's broadcast shutdown channel: `wait` blocks
/// until the signal fires once, then returns immediately forever after.
struct ShutdownSignal {
    fired: bool,
    notify: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    fn subscribe(sender: &broadcast::Sender<()>) -> ShutdownSignal {
        ShutdownSignal {
            fired: false,
            notify: sender.subscribe(),
        }
    }

    async fn wait(&mut self) {
        if self.fired {
            return;
        }
        let _ = self.notify.recv().await;
        self.fired = true;
    }
}

/// Creates TCP transports for client sessions. Must live inside a tokio
/// runtime; connect, send and read all run as spawned tasks.
#[derive(Debug, Default)]
pub struct TcpTransportProvider;

impl TcpTransportProvider {
    pub fn new() -> Arc<TcpTransportProvider> {
        Arc::new(TcpTransportProvider)
    }
}

impl TransportProvider for TcpTransportProvider {
    fn create_client_transport(&self, remote_addr: SocketAddr) -> Arc<dyn SessionTransport> {
        TcpSessionTransport::new(remote_addr)
    }
}

struct TcpInner {
    remote_addr: SocketAddr,
    /// present while the connection is open; the writer is shared between
    /// send tasks, one of which runs at a time (the session serializes sends)
    writer: AsyncMutex<Option<BufWriter<OwnedWriteHalf>>>,
    /// hands read hints to the read loop; absent until the stream is attached
    read_hints: Mutex<Option<UnboundedSender<usize>>>,
    cancel: CancellationToken,
    closed: AtomicCell<bool>,
}

impl TcpInner {
    /// Installs an established stream and spawns the read loop. For accepted
    /// connections the acceptor's permit rides along and is released when the
    /// read loop exits.
    async fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        session: &Arc<RpcSession>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", self.remote_addr, e);
        }
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(BufWriter::new(write_half));

        let (hint_tx, hint_rx) = mpsc::unbounded_channel();
        *self.read_hints.lock() = Some(hint_tx);
        tokio::spawn(read_loop(
            self.clone(),
            session.clone(),
            read_half,
            hint_rx,
            permit,
        ));
    }
}

/// TCP rendering of the per-session transport capability.
pub struct TcpSessionTransport {
    inner: Arc<TcpInner>,
}

impl TcpSessionTransport {
    pub fn new(remote_addr: SocketAddr) -> Arc<TcpSessionTransport> {
        Arc::new(TcpSessionTransport {
            inner: Arc::new(TcpInner {
                remote_addr,
                writer: AsyncMutex::new(None),
                read_hints: Mutex::new(None),
                cancel: CancellationToken::new(),
                closed: AtomicCell::new(false),
            }),
        })
    }

    /// Binds an accepted socket to `session` and starts its read pipeline.
    pub async fn attach_accepted(
        &self,
        stream: TcpStream,
        session: &Arc<RpcSession>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        self.inner.attach(stream, session, permit).await;
    }
}

impl SessionTransport for TcpSessionTransport {
    fn connect(&self, session: &Arc<RpcSession>) {
        let inner = self.inner.clone();
        let session = session.clone();
        tokio::spawn(async move {
            match TcpStream::connect(inner.remote_addr).await {
                Ok(stream) => {
                    inner.attach(stream, &session, None).await;
                    session.set_connected();
                    session.start_read_next(READ_NEXT_DEFAULT);
                }
                Err(e) => {
                    warn!("connect to {} failed: {}", inner.remote_addr, e);
                    session.on_disconnected(false);
                }
            }
        });
    }

    fn send(&self, session: &Arc<RpcSession>, sig: u64) {
        let inner = self.inner.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let buffers = session.sending_buffers();
            let result = {
                let mut guard = inner.writer.lock().await;
                match guard.as_mut() {
                    Some(writer) => write_buffers(writer, &buffers).await,
                    None => Err(io::Error::new(
                        ErrorKind::NotConnected,
                        "connection already closed",
                    )),
                }
            };
            match result {
                Ok(()) => session.on_send_completed(sig),
                Err(e) => {
                    debug!("write to {} failed: {}", session.remote_address(), e);
                    session.on_disconnected(true);
                }
            }
        });
    }

    fn do_read(&self, _session: &Arc<RpcSession>, read_next: usize) {
        if let Some(hints) = self.inner.read_hints.lock().as_ref() {
            let _ = hints.send(read_next);
        }
    }

    fn close_on_fault_injection(&self, session: &Arc<RpcSession>) {
        if self.inner.closed.swap(true) {
            return;
        }
        warn!(
            "closing session on fault injection, remote = {}",
            session.remote_address()
        );
        self.inner.cancel.cancel();

        let inner = self.inner.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Some(mut writer) = inner.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
            session.on_disconnected(false);
        });
    }
}

async fn write_buffers(
    writer: &mut BufWriter<OwnedWriteHalf>,
    buffers: &[Bytes],
) -> io::Result<()> {
    for buffer in buffers {
        writer.write_all(buffer).await?;
    }
    writer.flush().await
}

/// Hint-driven read loop: each `do_read` releases one read step, whose bytes
/// are handed to the session's framing pipeline. EOF, read errors and frame
/// errors all end in `on_disconnected(false)`.
async fn read_loop(
    inner: Arc<TcpInner>,
    session: Arc<RpcSession>,
    mut read_half: OwnedReadHalf,
    mut hints: UnboundedReceiver<usize>,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    loop {
        let hint = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            hint = hints.recv() => match hint {
                Some(hint) => hint,
                None => break,
            },
        };
        buffer.reserve(hint.max(1024));

        let read = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            read = read_half.read_buf(&mut buffer) => read,
        };
        match read {
            Ok(0) => {
                debug!("connection to {} closed by peer", session.remote_address());
                session.on_disconnected(false);
                break;
            }
            Ok(_) => {
                let data = buffer.split();
                match session.on_read_completed(&data) {
                    Ok(read_next) => session.start_read_next(read_next),
                    Err(e) => {
                        error!(
                            "closing session to {}: {}",
                            session.remote_address(),
                            e
                        );
                        session.on_disconnected(false);
                        break;
                    }
                }
            }
            Err(e) => {
                debug!("read error from {}: {}", session.remote_address(), e);
                session.on_disconnected(false);
                break;
            }
        }
    }

    inner.cancel.cancel();
    inner.writer.lock().await.take();
}

/// Accept loop for inbound connections: every accepted socket becomes a
/// server session registered with the network. Connection count is bounded
/// by a semaphore; the permit is released when the session's read loop ends.
pub struct TcpServer {
    listener: TcpListener,
    net: Arc<ConnectionOrientedNetwork>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
}

impl TcpServer {
    pub fn new(
        listener: TcpListener,
        net: Arc<ConnectionOrientedNetwork>,
        max_connection: usize,
        notify_shutdown: broadcast::Sender<()>,
    ) -> TcpServer {
        TcpServer {
            listener,
            net,
            limit_connections: Arc::new(Semaphore::new(max_connection)),
            notify_shutdown,
        }
    }

    pub async fn run(&self) -> AppResult<()> {
        let mut shutdown = ShutdownSignal::subscribe(&self.notify_shutdown);
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .expect("connection semaphore closed");

            let socket = tokio::select! {
                res = self.accept() => res?,
                _ = shutdown.wait() => {
                    info!("tcp acceptor received shutdown signal");
                    return Ok(());
                }
            };

            let remote_addr = match socket.peer_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("failed to resolve peer address: {}", e);
                    continue;
                }
            };

            let transport = TcpSessionTransport::new(remote_addr);
            let session = self
                .net
                .create_server_session(remote_addr, transport.clone());
            self.net.on_server_session_accepted(&session);
            transport
                .attach_accepted(socket, &session, Some(permit))
                .await;
            session.start_read_next(READ_NEXT_DEFAULT);
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::NetworkError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!("tcp acceptor dropped");
    }
}
