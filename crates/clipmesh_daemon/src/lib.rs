use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use clipmesh_core::{
    dedup::SWEEP_INTERVAL, ClipError, ClipboardAdapter, ClipboardContent, Frame, Identity,
    PeerSpec, Result, SeenCache, Transport, TrustStore,
};

mod listener;
pub mod peer_group;

pub use peer_group::PeerGroup;
use peer_group::DialDecision;

/// How often a connected group re-checks its reader is still alive.
const CONNECTED_POLL: Duration = Duration::from_secs(1);

/// Idle sleep while waiting out the backoff window.
const BACKOFF_POLL: Duration = Duration::from_millis(500);

pub struct NodeOptions {
    pub port: u16,
    pub peers: Vec<PeerSpec>,
    pub poll_interval: Duration,
    pub clipboard: Arc<dyn ClipboardAdapter>,
    /// Present iff the encrypted transport is enabled for this node.
    pub identity: Option<Identity>,
    pub trust: Option<Arc<TrustStore>>,
}

/// A peer node: listens for inbound connections, maintains outbound
/// connections to every configured peer, polls the clipboard, and fans each
/// change out to the whole mesh.
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    port: u16,
    poll_interval: Duration,
    groups: Vec<Arc<PeerGroup>>,
    clipboard: Arc<dyn ClipboardAdapter>,
    identity: Option<Identity>,
    trust: Option<Arc<TrustStore>>,
    inbound: RwLock<HashMap<String, Arc<Transport>>>,
    seen: SeenCache,
    shutdown: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(options: NodeOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        let groups = options
            .peers
            .into_iter()
            .map(|spec| Arc::new(PeerGroup::new(spec)))
            .collect();

        Self {
            inner: Arc::new(NodeInner {
                port: options.port,
                poll_interval: options.poll_interval,
                groups,
                clipboard: options.clipboard,
                identity: options.identity,
                trust: options.trust,
                inbound: RwLock::new(HashMap::new()),
                seen: SeenCache::new(),
                shutdown,
                local_addr: OnceLock::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Binds the listener and spawns the acceptor, one maintenance task per
    /// peer group, the clipboard poller, and the dedup sweeper. A bind
    /// failure is fatal and surfaces to the caller's exit code.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.inner.port)).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.inner.local_addr.set(local_addr);

        info!("listening on port {}", local_addr.port());
        if let Some(identity) = &self.inner.identity {
            info!("encryption enabled, identity {}", identity.fingerprint());
        }

        let mut tasks = self.inner.tasks.lock().await;

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(accept_loop(inner, listener)));

        for group in &self.inner.groups {
            let inner = Arc::clone(&self.inner);
            let group = Arc::clone(group);
            tasks.push(tokio::spawn(maintain_peer_group(inner, group)));
        }

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(poll_clipboard(inner)));

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(sweep_seen(inner)));

        Ok(())
    }

    /// Signals shutdown to every task, closes all transports, and waits for
    /// the tasks to drain.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(true);

        for group in &self.inner.groups {
            group.close().await;
        }

        let inbound: Vec<Arc<Transport>> = {
            let mut map = self.inner.inbound.write().await;
            map.drain().map(|(_, transport)| transport).collect()
        };
        for transport in inbound {
            transport.close().await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        info!("node stopped");
    }

    /// The bound listener address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn groups(&self) -> &[Arc<PeerGroup>] {
        &self.inner.groups
    }

    pub async fn connected_peers(&self) -> usize {
        let mut count = 0;
        for group in &self.inner.groups {
            if group.is_connected().await {
                count += 1;
            }
        }
        count
    }

    pub async fn inbound_count(&self) -> usize {
        self.inner.inbound.read().await.len()
    }
}

async fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let handle = tokio::spawn(handle_inbound(Arc::clone(&inner), stream, addr));
                inner.tasks.lock().await.push(handle);
            }
            Err(e) => {
                debug!("accept error: {}", e);
            }
        }
    }
}

async fn handle_inbound(inner: Arc<NodeInner>, stream: TcpStream, addr: SocketAddr) {
    let addr = addr.to_string();

    let transport = match listener::establish_inbound(
        stream,
        inner.identity.as_ref(),
        inner.trust.as_ref(),
    )
    .await
    {
        Ok(transport) => Arc::new(transport),
        Err(ClipError::Trust(mismatch)) => {
            warn!("key verification failed for {}: {}", addr, mismatch);
            return;
        }
        Err(e) => {
            debug!("rejected inbound connection from {}: {}", addr, e);
            return;
        }
    };

    debug!("incoming connection from {}", addr);

    {
        let mut map = inner.inbound.write().await;
        map.insert(addr.clone(), Arc::clone(&transport));
    }

    let name = if transport.is_encrypted() {
        format!("{} (encrypted)", addr)
    } else {
        addr.clone()
    };
    read_loop(&inner, &transport, &name).await;

    transport.close().await;
    inner.inbound.write().await.remove(&addr);
    debug!("inbound connection from {} closed", addr);
}

async fn maintain_peer_group(inner: Arc<NodeInner>, group: Arc<PeerGroup>) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            return;
        }

        match group.poll_dial().await {
            DialDecision::Connected => {
                if sleep_or_shutdown(&mut shutdown, CONNECTED_POLL).await {
                    return;
                }
            }
            DialDecision::Backoff => {
                if sleep_or_shutdown(&mut shutdown, BACKOFF_POLL).await {
                    return;
                }
            }
            DialDecision::Dial => {
                match peer_group::dial_race(
                    &group.spec,
                    inner.identity.as_ref(),
                    inner.trust.as_ref(),
                )
                .await
                {
                    Some((transport, endpoint)) => {
                        group
                            .record_success(Arc::clone(&transport), endpoint.clone())
                            .await;

                        if transport.is_encrypted() {
                            info!(
                                "connected to {} via {} (encrypted)",
                                group.spec.name, endpoint.host_port
                            );
                        } else {
                            info!("connected to {} via {}", group.spec.name, endpoint.host_port);
                        }

                        let reader_inner = Arc::clone(&inner);
                        let reader_group = Arc::clone(&group);
                        let handle = tokio::spawn(async move {
                            read_loop(&reader_inner, &transport, &reader_group.spec.name).await;
                            transport.close().await;
                            reader_group.clear(&transport).await;
                            debug!("disconnected from {}", reader_group.spec.name);
                        });
                        inner.tasks.lock().await.push(handle);
                    }
                    None => {
                        let backoff = group.record_failure().await;
                        debug!(
                            "failed to connect to {} (tried {} addrs, backoff: {:?})",
                            group.spec.name,
                            group.spec.endpoints.len(),
                            backoff
                        );
                    }
                }
            }
        }
    }
}

/// Shared frame reader for inbound and outbound connections. Returns when
/// the connection dies or shutdown is signalled; recovery belongs to the
/// caller.
async fn read_loop(inner: &Arc<NodeInner>, transport: &Arc<Transport>, name: &str) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = transport.read_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("read error from {}: {}", name, e);
                return;
            }
        };

        let content = ClipboardContent::new(frame.kind, frame.payload);

        // Echo prevention: a digest seen on any path within the window is
        // dropped, never re-applied.
        if inner.seen.is_seen_recent(&content.digest).await {
            debug!(
                "skipping duplicate from {} (digest: {}...)",
                name,
                &content.digest[..8]
            );
            continue;
        }
        inner.seen.mark(&content.digest).await;

        if let Err(e) = inner.clipboard.write(&content).await {
            warn!("failed to write to clipboard: {}", e);
            continue;
        }

        debug!(
            "received {} ({} bytes) from {}",
            content.kind.label(),
            content.data.len(),
            name
        );
    }
}

async fn poll_clipboard(inner: Arc<NodeInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }

        let content = match inner.clipboard.read().await {
            Ok(content) => content,
            Err(e) => {
                debug!("clipboard read failed: {}", e);
                continue;
            }
        };

        if content.data.is_empty() {
            continue;
        }

        if inner.clipboard.last_digest().await.as_deref() == Some(content.digest.as_str()) {
            continue;
        }

        if inner.seen.is_seen_recent(&content.digest).await {
            // Freshly written by a peer; record it so the next tick is quiet,
            // but do not send it back out.
            inner.clipboard.set_last_digest(&content.digest).await;
            continue;
        }

        inner.seen.mark(&content.digest).await;
        inner.clipboard.set_last_digest(&content.digest).await;

        debug!(
            "clipboard changed: {} ({} bytes)",
            content.kind.label(),
            content.data.len()
        );

        let frame = Frame::new(content.kind, content.data);
        broadcast(&inner, &frame).await;
    }
}

/// Writes one frame to every connected outbound group and every registered
/// inbound connection. Best-effort and unordered; an outbound failure flips
/// the group back to disconnected, an inbound failure is left for its reader
/// to notice.
async fn broadcast(inner: &Arc<NodeInner>, frame: &Frame) {
    for group in &inner.groups {
        let Some(transport) = group.transport().await else {
            continue;
        };

        match transport.write_frame(frame).await {
            Ok(()) => debug!("sent to {}", group.spec.name),
            Err(e) => {
                debug!("failed to send to {}: {}", group.spec.name, e);
                transport.close().await;
                group.clear(&transport).await;
            }
        }
    }

    let inbound: Vec<(String, Arc<Transport>)> = {
        let map = inner.inbound.read().await;
        map.iter()
            .map(|(addr, transport)| (addr.clone(), Arc::clone(transport)))
            .collect()
    };

    for (addr, transport) in inbound {
        match transport.write_frame(frame).await {
            Ok(()) => debug!("sent to inbound {}", addr),
            Err(e) => debug!("failed to send to inbound {}: {}", addr, e),
        }
    }
}

async fn sweep_seen(inner: Arc<NodeInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => inner.seen.sweep().await,
        }
    }
}

/// Sleeps for `duration`, returning true if shutdown fired first.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipmesh_core::{parse_peers, ContentKind, MemoryClipboard, TrustStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TEST_POLL: Duration = Duration::from_millis(50);

    async fn start_node(
        peers: &str,
        clipboard: Arc<MemoryClipboard>,
        identity: Option<Identity>,
        trust: Option<Arc<TrustStore>>,
    ) -> Node {
        let node = Node::new(NodeOptions {
            port: 0,
            peers: parse_peers(peers),
            poll_interval: TEST_POLL,
            clipboard,
            identity,
            trust,
        });
        node.start().await.unwrap();
        node
    }

    fn addr_of(node: &Node) -> String {
        format!("127.0.0.1:{}", node.local_addr().unwrap().port())
    }

    async fn wait_connected(dialer: &Node, acceptor: &Node) {
        for _ in 0..200 {
            if dialer.connected_peers().await == 1 && acceptor.inbound_count().await == 1 {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for nodes to connect");
    }

    async fn wait_for_content(clip: &MemoryClipboard, expected: &[u8]) {
        for _ in 0..200 {
            if let Some(content) = clip.current().await {
                if content.data == expected {
                    return;
                }
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "timed out waiting for clipboard content {:?}",
            String::from_utf8_lossy(expected)
        );
    }

    async fn wait_for_any_write(clip: &MemoryClipboard) {
        for _ in 0..200 {
            if !clip.writes().await.is_empty() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for a clipboard write");
    }

    #[tokio::test]
    async fn two_node_text_sync_both_directions() {
        let clip_a = Arc::new(MemoryClipboard::new());
        let clip_b = Arc::new(MemoryClipboard::new());

        let node_a = start_node("", Arc::clone(&clip_a), None, None).await;
        let node_b = start_node(&addr_of(&node_a), Arc::clone(&clip_b), None, None).await;

        wait_connected(&node_b, &node_a).await;

        // B copies; A receives over B's outbound connection.
        clip_b.set_text("hello").await;
        wait_for_content(&clip_a, b"hello").await;

        let writes = clip_a.writes().await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind, ContentKind::Text);

        // A copies; B receives over the same inbound connection.
        clip_a.set_text("world").await;
        wait_for_content(&clip_b, b"world").await;

        node_b.stop().await;
        node_a.stop().await;
    }

    #[tokio::test]
    async fn received_content_is_not_rebroadcast() {
        let clip_a = Arc::new(MemoryClipboard::new());
        let clip_b = Arc::new(MemoryClipboard::new());

        let node_a = start_node("", Arc::clone(&clip_a), None, None).await;
        let node_b = start_node(&addr_of(&node_a), Arc::clone(&clip_b), None, None).await;

        wait_connected(&node_b, &node_a).await;

        clip_b.set_text("hello").await;
        wait_for_any_write(&clip_a).await;

        // Let A's poller observe the freshly written content for a while; it
        // must suppress the echo rather than send it back to B.
        sleep(TEST_POLL * 8).await;
        assert!(
            clip_b.writes().await.is_empty(),
            "peer echoed received content back"
        );

        node_b.stop().await;
        node_a.stop().await;
    }

    #[tokio::test]
    async fn oversize_frame_closes_connection_without_clipboard_write() {
        let clip_a = Arc::new(MemoryClipboard::new());
        let node_a = start_node("", Arc::clone(&clip_a), None, None).await;

        let mut stream = TcpStream::connect(addr_of(&node_a)).await.unwrap();

        let mut header = vec![ContentKind::Text as u8];
        header.extend_from_slice(&(10 * 1024 * 1024 + 1u32).to_be_bytes());
        stream.write_all(&header).await.unwrap();

        // The node closes the connection before reading any payload.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("node did not close the connection")
            .unwrap();
        assert_eq!(n, 0);
        assert!(clip_a.writes().await.is_empty());

        node_a.stop().await;
    }

    #[tokio::test]
    async fn dial_race_connects_via_the_live_address() {
        let clip_a = Arc::new(MemoryClipboard::new());
        let clip_b = Arc::new(MemoryClipboard::new());

        let node_a = start_node("", Arc::clone(&clip_a), None, None).await;

        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let live_addr = addr_of(&node_a);
        let node_b = start_node(
            &format!("{}|{}", dead_addr, live_addr),
            Arc::clone(&clip_b),
            None,
            None,
        )
        .await;

        wait_connected(&node_b, &node_a).await;

        let endpoint = node_b.groups()[0].active_endpoint().await.unwrap();
        assert_eq!(endpoint.host_port, live_addr);

        clip_b.set_text("raced").await;
        wait_for_content(&clip_a, b"raced").await;

        node_b.stop().await;
        node_a.stop().await;
    }

    #[tokio::test]
    async fn noise_sync_pins_keys_on_both_ends() {
        let id_a = Identity::generate().unwrap();
        let id_b = Identity::generate().unwrap();

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let trust_a = Arc::new(TrustStore::load(dir_a.path()).await.unwrap());
        let trust_b = Arc::new(TrustStore::load(dir_b.path()).await.unwrap());

        let clip_a = Arc::new(MemoryClipboard::new());
        let clip_b = Arc::new(MemoryClipboard::new());

        let node_a = start_node(
            "",
            Arc::clone(&clip_a),
            Some(id_a.clone()),
            Some(Arc::clone(&trust_a)),
        )
        .await;
        let addr_a = addr_of(&node_a);
        let node_b = start_node(
            &format!("noise:{}", addr_a),
            Arc::clone(&clip_b),
            Some(id_b.clone()),
            Some(Arc::clone(&trust_b)),
        )
        .await;

        wait_connected(&node_b, &node_a).await;

        clip_b.set_text("sealed").await;
        wait_for_content(&clip_a, b"sealed").await;

        // B pinned A's static key under the dialed address; A pinned B's
        // under B's source address.
        let pinned = trust_b.lookup(&addr_a).await.unwrap();
        assert_eq!(pinned.public_key, id_a.public);

        let store_a = tokio::fs::read_to_string(trust_a.path()).await.unwrap();
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        assert!(store_a.contains(&BASE64.encode(&id_b.public)));

        node_b.stop().await;
        node_a.stop().await;
    }

    #[tokio::test]
    async fn key_mismatch_refuses_connection_and_keeps_pinned_key() {
        let id_a = Identity::generate().unwrap();
        let id_b = Identity::generate().unwrap();

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let trust_a = Arc::new(TrustStore::load(dir_a.path()).await.unwrap());
        let trust_b = Arc::new(TrustStore::load(dir_b.path()).await.unwrap());

        let clip_a = Arc::new(MemoryClipboard::new());
        let clip_b = Arc::new(MemoryClipboard::new());

        let node_a = start_node("", Arc::clone(&clip_a), Some(id_a), Some(trust_a)).await;
        let addr_a = addr_of(&node_a);

        // B already pinned a different key for A's address, as if A had been
        // replaced by an impersonator.
        let wrong_key = vec![0x99; 32];
        trust_b.add(vec![addr_a.clone()], &wrong_key).await.unwrap();

        let node_b = start_node(
            &format!("noise:{}", addr_a),
            Arc::clone(&clip_b),
            Some(id_b),
            Some(Arc::clone(&trust_b)),
        )
        .await;

        sleep(Duration::from_millis(600)).await;
        assert_eq!(node_b.connected_peers().await, 0);

        // The pinned key is never rotated on mismatch.
        let pinned = trust_b.lookup(&addr_a).await.unwrap();
        assert_eq!(pinned.public_key, wrong_key);

        node_b.stop().await;
        node_a.stop().await;
    }

    #[tokio::test]
    async fn duplicate_frames_within_window_write_once() {
        let clip_a = Arc::new(MemoryClipboard::new());
        let node_a = start_node("", Arc::clone(&clip_a), None, None).await;

        let mut stream = TcpStream::connect(addr_of(&node_a)).await.unwrap();
        let frame = Frame::new(ContentKind::Text, b"once".to_vec());
        let bytes = frame.encode();
        stream.write_all(&bytes).await.unwrap();
        stream.write_all(&bytes).await.unwrap();

        wait_for_any_write(&clip_a).await;
        sleep(Duration::from_millis(200)).await;
        assert_eq!(clip_a.writes().await.len(), 1);

        node_a.stop().await;
    }
}
