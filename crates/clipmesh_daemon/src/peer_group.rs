use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use clipmesh_core::{noise, ClipError, Endpoint, Identity, PeerSpec, Result, Transport, TrustStore};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// One logical remote peer, possibly reachable via several interchangeable
/// addresses. Owns the outbound connection lifecycle; mutations are
/// serialized by the internal lock, which is never held across network I/O.
pub struct PeerGroup {
    pub spec: PeerSpec,
    state: Mutex<GroupState>,
}

struct GroupState {
    transport: Option<Arc<Transport>>,
    active_endpoint: Option<Endpoint>,
    backoff: Duration,
    last_attempt: Option<Instant>,
}

/// What the maintenance loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialDecision {
    /// A connection is live; check back later.
    Connected,
    /// Still inside the backoff window.
    Backoff,
    /// Dial now; the attempt timestamp has been recorded.
    Dial,
}

impl PeerGroup {
    pub fn new(spec: PeerSpec) -> Self {
        Self {
            spec,
            state: Mutex::new(GroupState {
                transport: None,
                active_endpoint: None,
                backoff: INITIAL_BACKOFF,
                last_attempt: None,
            }),
        }
    }

    /// Snapshot of the current transport for broadcasting; the write itself
    /// happens outside the group lock.
    pub async fn transport(&self) -> Option<Arc<Transport>> {
        self.state.lock().await.transport.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.transport.is_some()
    }

    pub async fn active_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().await.active_endpoint.clone()
    }

    pub async fn current_backoff(&self) -> Duration {
        self.state.lock().await.backoff
    }

    pub(crate) async fn poll_dial(&self) -> DialDecision {
        let mut state = self.state.lock().await;
        if state.transport.is_some() {
            return DialDecision::Connected;
        }

        let due = match state.last_attempt {
            None => true,
            Some(at) => at.elapsed() >= state.backoff,
        };
        if !due {
            return DialDecision::Backoff;
        }

        state.last_attempt = Some(Instant::now());
        DialDecision::Dial
    }

    pub(crate) async fn record_success(&self, transport: Arc<Transport>, endpoint: Endpoint) {
        let mut state = self.state.lock().await;
        state.transport = Some(transport);
        state.active_endpoint = Some(endpoint);
        state.backoff = INITIAL_BACKOFF;
    }

    /// Doubles the backoff up to the cap, returning the new value.
    pub(crate) async fn record_failure(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.backoff = std::cmp::min(state.backoff * 2, MAX_BACKOFF);
        state.backoff
    }

    /// Clears the group back to disconnected, but only if `transport` is
    /// still the installed one; a newer connection from a later dial is left
    /// alone.
    pub async fn clear(&self, transport: &Arc<Transport>) {
        let mut state = self.state.lock().await;
        if let Some(current) = &state.transport {
            if Arc::ptr_eq(current, transport) {
                state.transport = None;
                state.active_endpoint = None;
            }
        }
    }

    pub async fn close(&self) {
        let transport = {
            let mut state = self.state.lock().await;
            state.active_endpoint = None;
            state.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

/// Dials every endpoint of the group concurrently and returns the first
/// fully established transport. For encrypted endpoints the handshake and
/// trust verification run inside the race, so the unit of success is a
/// verified transport rather than a bare socket. Losers are cancelled and
/// their sockets dropped; a second attempt completing after the winner is
/// closed so the peer never sees a duplicate connection.
pub(crate) async fn dial_race(
    spec: &PeerSpec,
    identity: Option<&Identity>,
    trust: Option<&Arc<TrustStore>>,
) -> Option<(Arc<Transport>, Endpoint)> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut attempts: JoinSet<Result<(Transport, Endpoint)>> = JoinSet::new();

    for endpoint in spec.endpoints.clone() {
        let cancel = cancel_rx.clone();
        let identity = identity.cloned();
        let trust = trust.cloned();
        attempts.spawn(async move { dial_endpoint(endpoint, identity, trust, cancel).await });
    }
    drop(cancel_rx);

    let mut winner: Option<(Arc<Transport>, Endpoint)> = None;
    let mut last_err: Option<ClipError> = None;

    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(Ok((transport, endpoint))) => {
                if winner.is_none() {
                    let _ = cancel_tx.send(true);
                    winner = Some((Arc::new(transport), endpoint));
                } else {
                    transport.close().await;
                }
            }
            Ok(Err(e)) => {
                if matches!(e, ClipError::Trust(_)) {
                    warn!("{}", e);
                } else {
                    last_err = Some(e);
                }
            }
            Err(e) => last_err = Some(ClipError::Other(format!("dial task failed: {}", e))),
        }
    }

    if winner.is_none() {
        if let Some(e) = last_err {
            debug!("dial error for {}: {}", spec.name, e);
        }
    }

    winner
}

async fn dial_endpoint(
    endpoint: Endpoint,
    identity: Option<Identity>,
    trust: Option<Arc<TrustStore>>,
    cancel: watch::Receiver<bool>,
) -> Result<(Transport, Endpoint)> {
    let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&endpoint.host_port))
        .await
        .map_err(|_| ClipError::Other(format!("dial timed out: {}", endpoint.host_port)))??;

    // Another endpoint won while this connect was in flight; dropping the
    // stream closes the racing socket.
    if *cancel.borrow() {
        return Err(ClipError::Other(format!(
            "dial cancelled: {}",
            endpoint.host_port
        )));
    }

    if endpoint.encrypted {
        let identity = identity.ok_or_else(|| {
            ClipError::Handshake("no identity loaded for encrypted endpoint".to_string())
        })?;

        let (state, peer_key) = noise::initiator_handshake(&mut stream, &identity).await?;

        if let Some(trust) = &trust {
            trust.verify(&endpoint.host_port, &peer_key).await?;
        }

        Ok((Transport::noise(stream, state, peer_key), endpoint))
    } else {
        Ok((Transport::plain(stream, Vec::new()), endpoint))
    }
}
