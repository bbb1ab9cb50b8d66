// The server owns one UDP socket and one session table, and answers datagrams strictly one at a
// time: receive, hand to the session table, send whatever it says to send, repeat.
//
// Storage I/O happens inline, so a slow disk stalls every peer. There are no timeouts either; a
// peer that disappears mid-transfer keeps its session (and open file) until shutdown.

use crate::session::{Outcome, SessionTable};
use crate::storage::{FsStorage, Storage};
use crate::tftp::{self, Response, SocketResult, TftpSocket};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub bind: SocketAddr,

    /// Directory files are served from and written to.
    pub root: PathBuf,

    /// Refuse all write requests.
    pub read_only: bool,
}

pub struct Server<S: Storage> {
    /// The TFTP socket used to send and receive packets.
    sock: TftpSocket,

    storage: S,

    sessions: SessionTable<S::Stream>,
}

impl Server<FsStorage> {
    /// Binds the configured address and serves the configured directory.
    pub fn bind(config: &ServerConfig) -> SocketResult<Server<FsStorage>> {
        let sock = TftpSocket::bind(config.bind)?;
        let storage = FsStorage::new(&config.root).read_only(config.read_only);
        Ok(Server::new(sock, storage))
    }
}

impl<S: Storage> Server<S> {
    pub fn new(sock: TftpSocket, storage: S) -> Server<S> {
        Server { sock, storage, sessions: SessionTable::new() }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn sessions(&self) -> &SessionTable<S::Stream> {
        &self.sessions
    }

    /// Answers datagrams until the future is dropped.
    pub async fn serve(&mut self) {
        log::info!("Listening on {:?}", self.sock.local_addr());
        loop {
            if let Err(e) = self.serve_one().await {
                log::warn!("Error while reading packet: {e}");
            }
        }
    }

    /// Receives a single datagram and answers it. Datagrams too large to be TFTP packets are
    /// dropped without a reply.
    pub async fn serve_one(&mut self) -> SocketResult<Outcome> {
        let mut buf = [0; tftp::MAX_DATAGRAM_SIZE];
        let (total_read, src) = self.sock.recv(&mut buf).await?;

        let outcome = self
            .sessions
            .handle_datagram(&self.storage, src, &buf[..total_read])
            .await;

        if let Some(packet) = outcome.response() {
            self.send(&packet, src).await;
        }
        Ok(outcome)
    }

    /// Closes every session still in progress.
    pub async fn shutdown(mut self) {
        log::info!("Shutting down with {} open session(s)", self.sessions.len());
        self.sessions.close_all().await;
    }

    async fn send(&self, packet: &Response, dst: SocketAddr) {
        // A failed send is not retried. The peer will have to restart the transfer.
        if let Err(e) = self.sock.send(packet, dst).await {
            log::warn!("Unable to send packet to {dst}: {e}");
        }
    }
}
