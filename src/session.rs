// This module tracks every in-progress transfer, keyed by the peer's transport address (its
// transfer ID).
//
// A peer has no session until it sends a legal read or write request. From then on every packet
// it sends is validated against the session and handed to the session's packet processor, which
// does the actual file I/O and picks the next packet to send. The session ends when the processor
// says so, or as soon as anything goes wrong: every failure turns into exactly one ERROR packet and
// the session's stream is released.
//
// The table is owned by the server loop and mutated one datagram at a time, so it needs no
// synchronization.

use crate::error::TftpError;
use crate::processor::{PacketProcessor, ResultAction};
use crate::storage::Storage;
use crate::tftp::{ErrorCode, Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// What the server should do after handling one datagram.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// The session continues; send the packet to the peer.
    Continue(Response),

    /// The session has ended, optionally with one last packet for the peer.
    Terminated(Option<Response>),

    /// Nothing to send and nothing changed.
    Ignored,

    /// The datagram was refused. Report the error to the peer; any session it had is gone.
    Failed(TftpError),
}

impl Outcome {
    /// The packet to put on the wire, if any.
    pub fn response(&self) -> Option<Response> {
        match self {
            Outcome::Continue(p) | Outcome::Terminated(Some(p)) => Some(p.clone()),
            Outcome::Failed(e) => Some(e.to_response()),
            Outcome::Terminated(None) | Outcome::Ignored => None,
        }
    }
}

/// One transfer with one peer.
#[derive(Debug)]
pub struct Session<T> {
    /// The file being transferred, as the peer named it.
    path: String,

    processor: PacketProcessor<T>,
}

impl<T> Session<T> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_read(&self) -> bool {
        matches!(self.processor, PacketProcessor::Read(_))
    }
}

/// Every live session, at most one per peer address.
#[derive(Debug)]
pub struct SessionTable<T> {
    sessions: HashMap<SocketAddr, Session<T>>,
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        SessionTable { sessions: HashMap::new() }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> SessionTable<T> {
    pub fn new() -> SessionTable<T> {
        SessionTable::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&Session<T>> {
        self.sessions.get(peer)
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Runs one datagram from `src` through decoding, validation and file I/O.
    pub async fn handle_datagram<S>(&mut self, storage: &S, src: SocketAddr, datagram: &[u8]) -> Outcome
    where
        S: Storage<Stream = T>,
    {
        match self.advance(storage, src, datagram).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Request from {src} failed: {e}");
                self.end_session(src).await;
                Outcome::Failed(e)
            }
        }
    }

    /// Closes every open stream. Used when the server shuts down.
    pub async fn close_all(&mut self) {
        let peers: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.end_session(peer).await;
        }
    }

    async fn advance<S>(&mut self, storage: &S, src: SocketAddr, datagram: &[u8]) -> Result<Outcome, TftpError>
    where
        S: Storage<Stream = T>,
    {
        let request = Request::parse_from_buf(datagram)?;
        log::debug!("Got packet from {src}: {request}");

        if let Request::Unknown { opcode } = request {
            log::warn!("Peer {src} sent unknown opcode {opcode}");
            return Err(TftpError::new(ErrorCode::IllegalOperation));
        }

        let Some(session) = self.sessions.get_mut(&src) else {
            return self.open_session(storage, src, request).await;
        };

        let action = match request {
            Request::Error { code, message } => {
                // Peer errors are only logged. The session stays open and the peer may carry on.
                log::warn!("Peer {src} sent error packet: code: {code:?}, message: '{message}'");
                return Ok(Outcome::Ignored);
            }
            Request::ReadReq { .. } | Request::WriteReq { .. } => {
                return Err(TftpError::illegal(format!(
                    "A transfer is already in progress for {src}, cannot start another one"
                )));
            }
            packet => session.processor.process_packet(&packet).await?,
        };

        Ok(self.settle(src, action).await)
    }

    /// Starts a session for a peer that has none. Only read and write requests may do so.
    async fn open_session<S>(&mut self, storage: &S, src: SocketAddr, request: Request) -> Result<Outcome, TftpError>
    where
        S: Storage<Stream = T>,
    {
        let (path, mut processor) = match request {
            Request::ReadReq { path } => {
                let (stream, size) = storage.open(&path).await?;
                (path, PacketProcessor::new_for_reading(stream, size))
            }
            Request::WriteReq { path } => {
                let stream = storage.create_new(&path).await?;
                (path, PacketProcessor::new_for_writing(stream))
            }
            other => {
                log::warn!("Got {other} from {src}, which has no transfer in progress");
                return Err(TftpError::new(ErrorCode::UnknownTransferId));
            }
        };

        let action = processor.first_packet().await?;

        let session = Session { path, processor };
        log::info!(
            "Got new client {src}, {} '{}'",
            if session.is_read() { "reading" } else { "writing" },
            session.path
        );
        self.sessions.insert(src, session);

        Ok(self.settle(src, action).await)
    }

    async fn settle(&mut self, src: SocketAddr, action: ResultAction) -> Outcome {
        match action {
            ResultAction::SendPacketAndAwait(p) => Outcome::Continue(p),
            ResultAction::TerminateWithPacket(p) => {
                self.end_session(src).await;
                Outcome::Terminated(Some(p))
            }
            ResultAction::CloseConnection => {
                self.end_session(src).await;
                Outcome::Terminated(None)
            }
        }
    }

    /// Removes the peer's session, if any, and releases its stream.
    async fn end_session(&mut self, src: SocketAddr) {
        if let Some(session) = self.sessions.remove(&src) {
            log::info!("Closing connection with {src} ('{}')", session.path);
            if let Err(e) = session.processor.close().await {
                log::warn!("Failed to close '{}' for {src}: {e}", session.path);
            }
        }
    }
}
