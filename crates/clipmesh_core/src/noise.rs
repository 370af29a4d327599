use snow::{Builder, HandshakeState, TransportState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClipError, Result};
use crate::identity::Identity;

/// First byte on the raw socket from an initiator choosing the encrypted
/// path. Plain frames always start with a non-zero kind byte, which keeps
/// this discriminator unambiguous.
pub const MAGIC_NOISE: u8 = 0x00;

pub const NOISE_PROTOCOL: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Maximum size of a single noise frame (u16 length prefix).
pub const MAX_NOISE_MESSAGE: usize = 65535;

/// ChaCha20-Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Largest plaintext chunk that fits one noise frame with its tag.
pub const MAX_NOISE_PLAINTEXT: usize = MAX_NOISE_MESSAGE - TAG_LEN;

pub(crate) fn builder() -> Result<Builder<'static>> {
    let params = NOISE_PROTOCOL
        .parse()
        .map_err(|e| ClipError::Handshake(format!("invalid noise parameters: {}", e)))?;
    Ok(Builder::new(params))
}

fn handshake_state(identity: &Identity, initiator: bool) -> Result<HandshakeState> {
    let params = NOISE_PROTOCOL
        .parse()
        .map_err(|e| ClipError::Handshake(format!("invalid noise parameters: {}", e)))?;
    let builder = Builder::new(params).local_private_key(&identity.private);
    let state = if initiator {
        builder.build_initiator()
    } else {
        builder.build_responder()
    };
    state.map_err(|e| ClipError::Handshake(format!("failed to create handshake state: {}", e)))
}

/// Client side of the XX handshake:
///
/// ```text
/// initiator → responder : e
/// initiator ← responder : e, ee, s, es
/// initiator → responder : s, se
/// ```
///
/// Writes the magic discriminator byte before the first message. Returns the
/// transport cipher state and the responder's static public key for TOFU
/// verification.
pub async fn initiator_handshake<S>(
    stream: &mut S,
    identity: &Identity,
) -> Result<(TransportState, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[MAGIC_NOISE]).await?;

    let mut hs = handshake_state(identity, true)?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];

    // -> e
    let n = hs
        .write_message(&[], &mut buf)
        .map_err(|e| ClipError::Handshake(format!("failed to write message 1: {}", e)))?;
    write_noise_frame(stream, &buf[..n]).await?;

    // <- e, ee, s, es
    let msg2 = read_noise_frame(stream).await?;
    hs.read_message(&msg2, &mut buf)
        .map_err(|e| ClipError::Handshake(format!("failed to process message 2: {}", e)))?;

    // -> s, se
    let n = hs
        .write_message(&[], &mut buf)
        .map_err(|e| ClipError::Handshake(format!("failed to write message 3: {}", e)))?;
    write_noise_frame(stream, &buf[..n]).await?;

    finish(hs)
}

/// Server side of the XX handshake. The caller has already consumed the
/// magic byte while discriminating the protocol.
pub async fn responder_handshake<S>(
    stream: &mut S,
    identity: &Identity,
) -> Result<(TransportState, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hs = handshake_state(identity, false)?;
    let mut buf = vec![0u8; MAX_NOISE_MESSAGE];

    // -> e
    let msg1 = read_noise_frame(stream).await?;
    hs.read_message(&msg1, &mut buf)
        .map_err(|e| ClipError::Handshake(format!("failed to process message 1: {}", e)))?;

    // <- e, ee, s, es
    let n = hs
        .write_message(&[], &mut buf)
        .map_err(|e| ClipError::Handshake(format!("failed to write message 2: {}", e)))?;
    write_noise_frame(stream, &buf[..n]).await?;

    // -> s, se
    let msg3 = read_noise_frame(stream).await?;
    hs.read_message(&msg3, &mut buf)
        .map_err(|e| ClipError::Handshake(format!("failed to process message 3: {}", e)))?;

    finish(hs)
}

fn finish(hs: HandshakeState) -> Result<(TransportState, Vec<u8>)> {
    let peer_key = hs
        .get_remote_static()
        .ok_or_else(|| ClipError::Handshake("peer did not deliver a static key".to_string()))?
        .to_vec();

    let transport = hs
        .into_transport_mode()
        .map_err(|e| ClipError::Handshake(format!("failed to enter transport mode: {}", e)))?;

    Ok((transport, peer_key))
}

/// Writes one length-prefixed noise frame, used both during the handshake
/// and for encrypted application data.
pub async fn write_noise_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_NOISE_MESSAGE {
        return Err(ClipError::Protocol(format!(
            "noise frame too large: {} > {}",
            data.len(),
            MAX_NOISE_MESSAGE
        )));
    }

    let mut frame = Vec::with_capacity(2 + data.len());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(data);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads one length-prefixed noise frame.
pub async fn read_noise_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let len = u16::from_be_bytes(header) as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshake_pair() -> (
        (TransportState, Vec<u8>),
        (TransportState, Vec<u8>),
        Identity,
        Identity,
    ) {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);

        let bob_clone = bob.clone();
        let responder = tokio::spawn(async move {
            // The acceptor consumes the discriminator byte before handing the
            // stream to the responder handshake.
            let mut magic = [0u8; 1];
            server.read_exact(&mut magic).await.unwrap();
            assert_eq!(magic[0], MAGIC_NOISE);
            responder_handshake(&mut server, &bob_clone).await.unwrap()
        });

        let initiator = initiator_handshake(&mut client, &alice).await.unwrap();
        let responder = responder.await.unwrap();

        (initiator, responder, alice, bob)
    }

    #[tokio::test]
    async fn xx_handshake_delivers_static_keys() {
        let ((_, bob_seen), (_, alice_seen), alice, bob) = handshake_pair().await;

        assert_eq!(bob_seen, bob.public);
        assert_eq!(alice_seen, alice.public);
    }

    #[tokio::test]
    async fn transport_mode_round_trip() {
        let ((mut tx, _), (mut rx, _), _, _) = handshake_pair().await;

        let plaintext = b"clipboard bytes under encryption";
        let mut ct = vec![0u8; MAX_NOISE_MESSAGE];
        let n = tx.write_message(plaintext, &mut ct).unwrap();
        assert_eq!(n, plaintext.len() + TAG_LEN);

        let mut pt = vec![0u8; MAX_NOISE_MESSAGE];
        let n = rx.read_message(&ct[..n], &mut pt).unwrap();
        assert_eq!(&pt[..n], plaintext);
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_decryption() {
        let ((mut tx, _), (mut rx, _), _, _) = handshake_pair().await;

        let mut ct = vec![0u8; MAX_NOISE_MESSAGE];
        let n = tx.write_message(b"payload", &mut ct).unwrap();
        ct[0] ^= 0x01;

        let mut pt = vec![0u8; MAX_NOISE_MESSAGE];
        assert!(rx.read_message(&ct[..n], &mut pt).is_err());
    }

    #[tokio::test]
    async fn noise_frame_round_trip_and_size_limit() {
        let (mut a, mut b) = tokio::io::duplex(MAX_NOISE_MESSAGE * 2);

        write_noise_frame(&mut a, b"abc").await.unwrap();
        assert_eq!(read_noise_frame(&mut b).await.unwrap(), b"abc");

        let too_big = vec![0u8; MAX_NOISE_MESSAGE + 1];
        let err = write_noise_frame(&mut a, &too_big).await.unwrap_err();
        assert!(matches!(err, ClipError::Protocol(_)), "got: {err}");
    }
}
