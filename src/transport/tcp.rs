//! Local voice transport: serves the encoded Ogg stream to any TCP client,
//! e.g. `ffplay tcp://127.0.0.1:7878`.

use super::{VoiceConnection, VoiceResource, VoiceTransport};
use crate::{
    processor::EncodedStream,
    song::{ChannelId, GuildId, UserId},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// The only channel of the local transport.
pub const LOCAL_CHANNEL: ChannelId = 1;

const CLIENT_BACKLOG: usize = 256;

/// Ogg pages carrying the Opus identification and comment headers.
const OGG_HEADER_PAGES: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Every user counts as sitting in [`LOCAL_CHANNEL`].
pub struct TcpTransport {
    listen: String,
}

impl TcpTransport {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
        }
    }
}

#[async_trait]
impl VoiceTransport for TcpTransport {
    async fn user_channel(&self, _guild: GuildId, _user: UserId) -> Option<ChannelId> {
        Some(LOCAL_CHANNEL)
    }

    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<Arc<dyn VoiceConnection>> {
        let connection = TcpConnection::bind(&self.listen).await?;
        info!(
            "[guild {guild}] Serving channel {channel} on tcp://{}",
            connection.local_addr()
        );
        Ok(Arc::new(connection))
    }
}

pub struct TcpConnection {
    addr: SocketAddr,
    clients: broadcast::Sender<Bytes>,
    /// Stream headers of the current resource, replayed to late clients
    header: Arc<Mutex<Bytes>>,
    paused: watch::Sender<bool>,
    current: Mutex<Option<Arc<TcpResource>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpConnection {
    pub async fn bind(listen: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to listen on {listen}"))?;
        let addr = listener.local_addr()?;

        let (clients, _) = broadcast::channel(CLIENT_BACKLOG);
        let (paused, _) = watch::channel(false);
        let header = Arc::new(Mutex::new(Bytes::new()));
        let cancel = CancellationToken::new();

        let accept_loop = {
            let clients = clients.clone();
            let header = header.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = accept(&listener, &clients, &header, &cancel) => result,
                    };

                    match result {
                        Ok(addr) => info!("Accepted connection from {}", addr),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            })
        };

        Ok(Self {
            addr,
            clients,
            header,
            paused,
            current: Mutex::new(None),
            cancel,
            tasks: Mutex::new(vec![accept_loop]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

async fn accept(
    listener: &TcpListener,
    clients: &broadcast::Sender<Bytes>,
    header: &Arc<Mutex<Bytes>>,
    cancel: &CancellationToken,
) -> Result<SocketAddr> {
    let (stream, addr) = listener.accept().await?;

    let rx = clients.subscribe();
    let header = lock(header).clone();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = serve_client(stream, header, rx) => {}
        }
        debug!("Client {} disconnected", addr);
    });

    Ok(addr)
}

async fn serve_client(mut stream: TcpStream, header: Bytes, mut rx: broadcast::Receiver<Bytes>) {
    // Players can only decode a stream that starts with its headers
    if !header.is_empty() {
        if let Err(e) = stream.write_all(&header).await {
            debug!("Failed to write stream header: {}", e);
            return;
        }
    }

    loop {
        let data = match rx.recv().await {
            Ok(data) => data,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Client lagged behind, skipped {n} packets");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let Err(e) = stream.write_all(&data).await {
            debug!("Failed to write audio: {}", e);
            break;
        }
    }
}

/// Length of the first `pages` complete Ogg pages in `buf`, if present.
pub fn ogg_pages_len(buf: &[u8], pages: usize) -> Option<usize> {
    let mut offset = 0;

    for _ in 0..pages {
        let page = buf.get(offset..)?;
        if page.len() < 27 || &page[..4] != b"OggS" {
            return None;
        }

        let segments = page[26] as usize;
        let table = page.get(27..27 + segments)?;
        let body: usize = table.iter().map(|len| *len as usize).sum();

        let len = 27 + segments + body;
        if page.len() < len {
            return None;
        }
        offset += len;
    }

    Some(offset)
}

#[async_trait]
impl VoiceConnection for TcpConnection {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn play(&self, mut stream: EncodedStream) -> Result<Arc<dyn VoiceResource>> {
        self.stop();

        let resource = Arc::new(TcpResource::new(self.cancel.child_token()));
        *lock(&self.current) = Some(resource.clone());
        *lock(&self.header) = Bytes::new();

        let clients = self.clients.clone();
        let header = self.header.clone();
        let mut paused = self.paused.subscribe();
        let task = {
            let resource = resource.clone();
            tokio::spawn(async move {
                let mut pending_header = BytesMut::new();
                let mut header_done = false;

                let forward = async {
                    loop {
                        // Not pulling while paused leaves the audio buffered upstream
                        if paused.wait_for(|paused| !*paused).await.is_err() {
                            break;
                        }

                        let Some(data) = stream.recv().await else {
                            resource.ended.store(true, Ordering::SeqCst);
                            break;
                        };

                        if !header_done {
                            pending_header.extend_from_slice(&data);
                            if let Some(len) = ogg_pages_len(&pending_header, OGG_HEADER_PAGES) {
                                *lock(&header) = pending_header.split_to(len).freeze();
                                header_done = true;
                            }
                        }

                        // Pausing may have happened while waiting for data
                        if paused.wait_for(|paused| !*paused).await.is_err() {
                            break;
                        }

                        // No listeners is not an error
                        let _ = clients.send(data);
                    }
                };

                tokio::select! {
                    _ = resource.cancel.cancelled() => {}
                    _ = forward => {}
                }
            })
        };

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);

        Ok(resource)
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn unpause(&self) {
        self.paused.send_replace(false);
    }

    fn stop(&self) {
        if let Some(resource) = lock(&self.current).take() {
            resource.cancel.cancel();
        }
    }

    async fn destroy(&self) {
        self.stop();
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        info!("Closed tcp://{}", self.addr);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct TcpResource {
    ended: AtomicBool,
    cancel: CancellationToken,
}

impl TcpResource {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            ended: AtomicBool::new(false),
            cancel,
        }
    }
}

impl VoiceResource for TcpResource {
    fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn error(&self) -> Option<String> {
        None
    }
}
