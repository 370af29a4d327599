use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use snow::TransportState;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{ClipError, Result};
use crate::frame::{self, Frame, FRAME_READ_TIMEOUT, FRAME_WRITE_TIMEOUT, HEADER_LEN};
use crate::noise;

/// Replays previously peeked bytes before reading from the underlying
/// stream. The acceptor consumes one byte to discriminate the protocol and
/// pushes it back through this adapter so the codec sees an intact frame.
pub struct PrefixedReader<R> {
    inner: R,
    prefix: Vec<u8>,
    pos: usize,
}

impl<R> PrefixedReader<R> {
    pub fn new(inner: R, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if me.pos < me.prefix.len() {
            let n = std::cmp::min(buf.remaining(), me.prefix.len() - me.pos);
            buf.put_slice(&me.prefix[me.pos..me.pos + n]);
            me.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

/// Full-duplex connection to a peer carrying clipboard frames, either raw
/// TCP or Noise-encrypted. Read and write sides are independently locked so
/// one reader task and any number of broadcasters can share the transport;
/// the Noise cipher state is only ever touched under those locks.
pub struct Transport {
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
    peer_addr: String,
    encrypted: bool,
    peer_static: Option<Vec<u8>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer_addr", &self.peer_addr)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

enum ReadHalf {
    Plain(PrefixedReader<OwnedReadHalf>),
    Noise(NoiseReader),
}

enum WriteHalf {
    Plain(OwnedWriteHalf),
    Noise {
        stream: OwnedWriteHalf,
        state: Arc<Mutex<TransportState>>,
    },
}

struct NoiseReader {
    stream: OwnedReadHalf,
    state: Arc<Mutex<TransportState>>,
    /// Decrypted bytes not yet consumed by the caller.
    buf: Vec<u8>,
}

impl NoiseReader {
    async fn fill(&mut self) -> Result<()> {
        let ciphertext = noise::read_noise_frame(&mut self.stream).await?;
        let mut plaintext = vec![0u8; noise::MAX_NOISE_MESSAGE];
        let n = self
            .state
            .lock()
            .await
            .read_message(&ciphertext, &mut plaintext)
            .map_err(|e| ClipError::Handshake(format!("decryption failed: {}", e)))?;
        self.buf.extend_from_slice(&plaintext[..n]);
        Ok(())
    }

    async fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        while self.buf.len() < out.len() {
            self.fill().await?;
        }
        out.copy_from_slice(&self.buf[..out.len()]);
        self.buf.drain(..out.len());
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; HEADER_LEN];
        self.read_exact(&mut header).await?;

        let (kind, len) = frame::parse_header(&header)?;

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Ok(Frame { kind, payload })
    }
}

impl Transport {
    /// Wraps a raw TCP connection. `prefix` carries any bytes the acceptor
    /// consumed while discriminating the protocol.
    pub fn plain(stream: TcpStream, prefix: Vec<u8>) -> Self {
        let peer_addr = peer_addr_of(&stream);
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(ReadHalf::Plain(PrefixedReader::new(read, prefix))),
            writer: Mutex::new(WriteHalf::Plain(write)),
            peer_addr,
            encrypted: false,
            peer_static: None,
        }
    }

    /// Wraps a connection whose Noise handshake already completed. The
    /// transport cipher state is shared between the halves; each direction
    /// serializes access through its own lock.
    pub fn noise(stream: TcpStream, state: TransportState, peer_static: Vec<u8>) -> Self {
        let peer_addr = peer_addr_of(&stream);
        let (read, write) = stream.into_split();
        let state = Arc::new(Mutex::new(state));
        Self {
            reader: Mutex::new(ReadHalf::Noise(NoiseReader {
                stream: read,
                state: Arc::clone(&state),
                buf: Vec::new(),
            })),
            writer: Mutex::new(WriteHalf::Noise {
                stream: write,
                state,
            }),
            peer_addr,
            encrypted: true,
            peer_static: Some(peer_static),
        }
    }

    /// Reads the next frame, enforcing the per-frame idle deadline.
    pub async fn read_frame(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        match &mut *reader {
            ReadHalf::Plain(r) => frame::read_frame(r).await,
            ReadHalf::Noise(r) => timeout(FRAME_READ_TIMEOUT, r.read_frame())
                .await
                .map_err(|_| ClipError::Protocol("frame read timed out".to_string()))?,
        }
    }

    /// Writes one frame under the write deadline. On the encrypted path the
    /// frame bytes are fragmented into noise frames of bounded plaintext.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match &mut *writer {
            WriteHalf::Plain(w) => frame::write_frame(w, frame).await,
            WriteHalf::Noise { stream, state } => {
                timeout(FRAME_WRITE_TIMEOUT, async {
                    let bytes = frame.encode();
                    for chunk in bytes.chunks(noise::MAX_NOISE_PLAINTEXT) {
                        let mut ciphertext = vec![0u8; noise::MAX_NOISE_MESSAGE];
                        let n = state
                            .lock()
                            .await
                            .write_message(chunk, &mut ciphertext)
                            .map_err(|e| {
                                ClipError::Handshake(format!("encryption failed: {}", e))
                            })?;
                        noise::write_noise_frame(stream, &ciphertext[..n]).await?;
                    }
                    Ok(())
                })
                .await
                .map_err(|_| ClipError::Protocol("frame write timed out".to_string()))?
            }
        }
    }

    /// Shuts down the write side; the peer's reader sees EOF and both ends
    /// unwind. Errors here are ignored, the socket is going away regardless.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = match &mut *writer {
            WriteHalf::Plain(w) => w.shutdown().await,
            WriteHalf::Noise { stream, .. } => stream.shutdown().await,
        };
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn peer_static(&self) -> Option<&[u8]> {
        self.peer_static.as_deref()
    }
}

fn peer_addr_of(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::ContentKind;
    use crate::identity::Identity;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn prefixed_reader_replays_peeked_bytes() {
        let (mut a, b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"ello")
            .await
            .unwrap();
        drop(a);

        let mut reader = PrefixedReader::new(b, vec![b'h']);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn plain_transport_round_trip_with_prefix() {
        let (client, server) = tcp_pair().await;

        let frame = Frame::new(ContentKind::Text, b"plain text".to_vec());
        let client = Transport::plain(client, Vec::new());
        client.write_frame(&frame).await.unwrap();

        // Simulate the acceptor peeking the first byte for discrimination.
        let mut server = server;
        let mut peeked = [0u8; 1];
        server.read_exact(&mut peeked).await.unwrap();
        assert_eq!(peeked[0], ContentKind::Text as u8);

        let server = Transport::plain(server, peeked.to_vec());
        let decoded = server.read_frame().await.unwrap();
        assert_eq!(decoded, frame);
        assert!(!server.is_encrypted());
    }

    async fn noise_pair() -> (Transport, Transport, Identity, Identity) {
        let alice = Identity::generate().unwrap();
        let bob = Identity::generate().unwrap();

        let (mut client, mut server) = tcp_pair().await;

        let bob_clone = bob.clone();
        let responder = tokio::spawn(async move {
            let mut magic = [0u8; 1];
            server.read_exact(&mut magic).await.unwrap();
            assert_eq!(magic[0], noise::MAGIC_NOISE);
            let (state, peer_key) = noise::responder_handshake(&mut server, &bob_clone)
                .await
                .unwrap();
            Transport::noise(server, state, peer_key)
        });

        let (state, peer_key) = noise::initiator_handshake(&mut client, &alice)
            .await
            .unwrap();
        let client = Transport::noise(client, state, peer_key);
        let server = responder.await.unwrap();

        (client, server, alice, bob)
    }

    #[tokio::test]
    async fn noise_transport_round_trip() {
        let (client, server, alice, bob) = noise_pair().await;

        assert_eq!(client.peer_static(), Some(bob.public.as_slice()));
        assert_eq!(server.peer_static(), Some(alice.public.as_slice()));
        assert!(client.is_encrypted());

        let frame = Frame::new(ContentKind::Text, b"secret clipboard".to_vec());
        client.write_frame(&frame).await.unwrap();
        assert_eq!(server.read_frame().await.unwrap(), frame);

        // And the other direction on the same connection.
        let reply = Frame::new(ContentKind::Text, b"reply".to_vec());
        server.write_frame(&reply).await.unwrap();
        assert_eq!(client.read_frame().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn noise_transport_fragments_large_frames() {
        let (client, server, _, _) = noise_pair().await;

        // Larger than one noise frame's plaintext capacity, so the write
        // side must fragment and the read side must reassemble.
        let payload = vec![0x5A; noise::MAX_NOISE_PLAINTEXT * 2 + 1234];
        let frame = Frame::new(ContentKind::Image, payload);

        let write = client.write_frame(&frame);
        let read = server.read_frame();
        let (write, read) = tokio::join!(write, read);
        write.unwrap();
        assert_eq!(read.unwrap(), frame);
    }

    #[tokio::test]
    async fn close_unblocks_the_peer_reader() {
        let (client, server) = tcp_pair().await;
        let client = Transport::plain(client, Vec::new());
        let server = Transport::plain(server, Vec::new());

        client.close().await;
        let err = server.read_frame().await.unwrap_err();
        assert!(matches!(err, ClipError::Io(_)), "got: {err}");
    }
}
