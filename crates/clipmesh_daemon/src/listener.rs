use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use clipmesh_core::{identity, noise, ClipError, Identity, Result, Transport, TrustStore};

/// Deadline for reading the single protocol-discriminator byte from an
/// accepted connection.
pub const DISCRIMINATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Establishes an accepted connection: reads exactly one byte to pick the
/// transport. 0x00 selects the encrypted path (responder handshake plus
/// trust verification); any other value is the first byte of a plain frame
/// header and is replayed into the codec.
pub(crate) async fn establish_inbound(
    mut stream: TcpStream,
    identity: Option<&Identity>,
    trust: Option<&Arc<TrustStore>>,
) -> Result<Transport> {
    let mut magic = [0u8; 1];
    timeout(DISCRIMINATOR_TIMEOUT, stream.read_exact(&mut magic))
        .await
        .map_err(|_| ClipError::Protocol("discriminator read timed out".to_string()))??;

    if magic[0] == noise::MAGIC_NOISE {
        let Some(identity) = identity else {
            return Err(ClipError::Protocol(
                "encrypted connection but crypto is not enabled".to_string(),
            ));
        };

        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let (state, peer_key) = noise::responder_handshake(&mut stream, identity).await?;

        if let Some(trust) = trust {
            trust.verify(&peer_addr, &peer_key).await?;
        }

        debug!(
            "incoming encrypted connection from {} (key: {})",
            peer_addr,
            identity::fingerprint(&peer_key)
        );
        Ok(Transport::noise(stream, state, peer_key))
    } else {
        Ok(Transport::plain(stream, magic.to_vec()))
    }
}
