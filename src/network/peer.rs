// Peer connection: framing over TCP and the handshake

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::core::{now, read_length, varint_tail_len, CHECKSUM_SIZE};
use crate::error::{ConnectionError, HandshakeError, ProtocolError};
use crate::network::message::FRAME_PREFIX_SIZE;
use crate::network::{Frame, HandshakeMessage, Message, NetworkType, Payload};

/// Largest accepted difference between our clock and a peer's offer
pub const MAX_HANDSHAKE_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    AwaitingHandshake,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

fn frame_io(err: io::Error) -> ConnectionError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => ConnectionError::Protocol(ProtocolError::Truncated),
        _ => ConnectionError::Io(err),
    }
}

/// Read one complete frame.
///
/// A clean EOF before the first byte is `Closed`; EOF inside a frame is `Truncated`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut head = vec![0u8; FRAME_PREFIX_SIZE + 1];
    if reader.read(&mut head[..1]).await? == 0 {
        return Err(ConnectionError::Closed);
    }
    reader.read_exact(&mut head[1..]).await.map_err(frame_io)?;

    let tail = varint_tail_len(head[FRAME_PREFIX_SIZE]);
    let start = head.len();
    head.resize(start + tail, 0);
    reader.read_exact(&mut head[start..]).await.map_err(frame_io)?;

    let size = read_length(&mut &head[FRAME_PREFIX_SIZE..])?;
    let start = head.len();
    head.resize(start + size + CHECKSUM_SIZE, 0);
    reader.read_exact(&mut head[start..]).await.map_err(frame_io)?;

    Ok(Frame::parse(&head)?)
}

/// Read and decode one message, which must belong to `network`
pub async fn read_message<R>(reader: &mut R, network: NetworkType) -> Result<Message, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader).await?;
    let found = NetworkType::from_code(frame.network)?;
    if found != network {
        return Err(ProtocolError::WrongNetwork {
            expected: network.code(),
            found: frame.network,
        }
        .into());
    }
    Ok(Message::from_frame(&frame)?)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let data = message.encode()?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Check a peer's offer or response against our own handshake
pub fn validate_handshake(ours: &HandshakeMessage, theirs: &HandshakeMessage) -> Result<(), HandshakeError> {
    if theirs.version != ours.version {
        return Err(HandshakeError::VersionMismatch {
            ours: ours.version,
            theirs: theirs.version,
        });
    }
    if theirs.node_identifier == ours.node_identifier {
        return Err(HandshakeError::SelfConnection);
    }
    let skew = (theirs.timestamp - now()).num_seconds();
    if skew.abs() > MAX_HANDSHAKE_CLOCK_SKEW_SECS {
        return Err(HandshakeError::ClockSkew(skew));
    }
    Ok(())
}

/// One TCP connection to another node
#[derive(Debug)]
pub struct Peer {
    addr: SocketAddr,
    direction: Direction,
    network: NetworkType,
    state: ConnectionState,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Wrap an accepted or freshly dialed stream
    pub fn new(stream: TcpStream, addr: SocketAddr, direction: Direction, network: NetworkType) -> Self {
        let (reader, writer) = stream.into_split();
        let mut peer = Self {
            addr,
            direction,
            network,
            state: ConnectionState::Connecting,
            reader: BufReader::new(reader),
            writer,
        };
        peer.set_state(ConnectionState::AwaitingHandshake);
        peer
    }

    /// Dial a peer, giving up after `timeout`
    pub async fn connect(addr: SocketAddr, network: NetworkType, timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
        stream.set_nodelay(true)?;
        log::info!("Connected to peer {}", addr);
        Ok(Self::new(stream, addr, Direction::Outbound, network))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Peer {} {:?} -> {:?}", self.addr, self.state, state);
            self.state = state;
        }
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        write_message(&mut self.writer, message).await
    }

    pub async fn receive_message(&mut self) -> Result<Message, ConnectionError> {
        read_message(&mut self.reader, self.network).await
    }

    /// Exchange WVTO / WVBK.
    ///
    /// The dialing side offers first. `accept` runs after the peer's message
    /// passed validation and before the connection turns Active; an error
    /// from it aborts the handshake. The whole exchange is bounded by `timeout`.
    pub async fn handshake<T, F>(
        &mut self,
        ours: &HandshakeMessage,
        timeout: Duration,
        accept: F,
    ) -> Result<(HandshakeMessage, T), HandshakeError>
    where
        F: FnOnce(&HandshakeMessage) -> Result<T, HandshakeError>,
    {
        let result = match tokio::time::timeout(timeout, self.exchange(ours, accept)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout),
        };
        match &result {
            Ok(_) => self.set_state(ConnectionState::Active),
            Err(e) => {
                log::warn!("Handshake with {} failed: {}", self.addr, e);
                self.set_state(ConnectionState::Closed);
            }
        }
        result
    }

    async fn exchange<T, F>(&mut self, ours: &HandshakeMessage, accept: F) -> Result<(HandshakeMessage, T), HandshakeError>
    where
        F: FnOnce(&HandshakeMessage) -> Result<T, HandshakeError>,
    {
        match self.direction {
            Direction::Outbound => {
                self.send(Payload::HandshakeOffer(ours.clone())).await?;
                let theirs = self.expect_handshake(false).await?;
                validate_handshake(ours, &theirs)?;
                let accepted = accept(&theirs)?;
                Ok((theirs, accepted))
            }
            Direction::Inbound => {
                let theirs = self.expect_handshake(true).await?;
                validate_handshake(ours, &theirs)?;
                let accepted = accept(&theirs)?;
                self.send(Payload::HandshakeResponse(ours.clone())).await?;
                Ok((theirs, accepted))
            }
        }
    }

    async fn send(&mut self, payload: Payload) -> Result<(), ConnectionError> {
        let message = Message::new(self.network, payload);
        self.send_message(&message).await
    }

    async fn expect_handshake(&mut self, offer: bool) -> Result<HandshakeMessage, HandshakeError> {
        let message = match self.receive_message().await {
            Ok(message) => message,
            Err(ConnectionError::Protocol(ProtocolError::WrongNetwork { found, .. })) => {
                return Err(HandshakeError::NetworkMismatch(found));
            }
            Err(e) => return Err(e.into()),
        };
        match (offer, message.payload) {
            (true, Payload::HandshakeOffer(theirs)) | (false, Payload::HandshakeResponse(theirs)) => Ok(theirs),
            (_, other) => Err(HandshakeError::UnexpectedMessage {
                expected: if offer { "WVTO" } else { "WVBK" },
                received: other.request_type().name(),
            }),
        }
    }

    /// Split into the read and write halves for the session tasks
    pub fn into_parts(self) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}
