//! End-to-end transfers over a real loopback UDP socket.
//!
//! The server is driven one datagram at a time with `serve_one`, alongside a hand-rolled client on
//! the same task, so every test knows exactly how many packets the server handles.

use std::net::SocketAddr;
use std::time::Duration;

use octet_tftpd::session::Outcome;
use octet_tftpd::tftp::{ErrorCode, Request, SocketError, TftpSocket};
use octet_tftpd::{FsStorage, Server};
use tempdir::TempDir;
use tokio::net::UdpSocket;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn start_server(root: &TempDir) -> (Server<FsStorage>, SocketAddr) {
    let sock = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).expect("bind server socket");
    let server = Server::new(sock, FsStorage::new(root.path()));
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Drives the server through exactly `count` datagrams.
async fn serve(server: &mut Server<FsStorage>, count: usize) -> Vec<Outcome> {
    let mut outcomes = vec![];
    for _ in 0..count {
        outcomes.push(server.serve_one().await.expect("server receive"));
    }
    outcomes
}

struct Client {
    sock: UdpSocket,
    server: SocketAddr,
}

impl Client {
    async fn new(server: SocketAddr) -> Client {
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind client socket");
        Client { sock, server }
    }

    async fn send(&self, packet: Request) {
        self.sock.send_to(&packet.to_bytes(), self.server).await.expect("client send");
    }

    async fn recv(&self) -> Request {
        let mut buf = [0; 2048];
        let (len, src) = tokio::time::timeout(Duration::from_secs(5), self.sock.recv_from(&mut buf))
            .await
            .expect("client receive timed out")
            .expect("client receive");
        assert_eq!(src, self.server);
        Request::parse_from_buf(&buf[..len]).expect("server sent a malformed packet")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_thousand_byte_file() {
    let root = TempDir::new("tftp").unwrap();
    let contents: Vec<u8> = (0..1000).map(|_| rand::random::<u8>()).collect();
    std::fs::write(root.path().join("foo.txt"), &contents).unwrap();
    let (mut server, addr) = start_server(&root);

    let client = async {
        let client = Client::new(addr).await;
        client.send(Request::ReadReq { path: "foo.txt".to_string() }).await;
        assert_eq!(client.recv().await, Request::Data { block: 1, data: contents[..512].to_vec() });
        client.send(Request::Ack { block: 1 }).await;
        assert_eq!(client.recv().await, Request::Data { block: 2, data: contents[512..].to_vec() });
        client.send(Request::Ack { block: 2 }).await;
    };

    let (outcomes, ()) = tokio::join!(serve(&mut server, 3), client);

    assert_eq!(outcomes.last(), Some(&Outcome::Terminated(None)));
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn write_file_in_blocks() {
    let root = TempDir::new("tftp").unwrap();
    let contents: Vec<u8> = (0..612).map(|_| rand::random::<u8>()).collect();
    let (mut server, addr) = start_server(&root);

    let client = async {
        let client = Client::new(addr).await;
        client.send(Request::WriteReq { path: "upload.bin".to_string() }).await;
        assert_eq!(client.recv().await, Request::Ack { block: 0 });

        for (i, chunk) in contents.chunks(512).enumerate() {
            let block = i as u16 + 1;
            client.send(Request::Data { block, data: chunk.to_vec() }).await;
            assert_eq!(client.recv().await, Request::Ack { block });
        }
    };

    tokio::join!(serve(&mut server, 3), client);

    assert!(server.sessions().is_empty());
    assert_eq!(std::fs::read(root.path().join("upload.bin")).unwrap(), contents);
}

#[tokio::test]
async fn ack_from_stranger_is_unknown_transfer() {
    let root = TempDir::new("tftp").unwrap();
    let (mut server, addr) = start_server(&root);

    let client = async {
        let client = Client::new(addr).await;
        client.send(Request::Ack { block: 1 }).await;
        client.recv().await
    };

    let (_, reply) = tokio::join!(serve(&mut server, 1), client);

    assert_eq!(
        reply,
        Request::Error { code: ErrorCode::UnknownTransferId, message: "Unknown transfer ID.".to_string() }
    );
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn missing_file_reported() {
    let root = TempDir::new("tftp").unwrap();
    let (mut server, addr) = start_server(&root);

    let client = async {
        let client = Client::new(addr).await;
        client.send(Request::ReadReq { path: "nope.txt".to_string() }).await;
        client.recv().await
    };

    let (_, reply) = tokio::join!(serve(&mut server, 1), client);

    assert_eq!(
        reply,
        Request::Error { code: ErrorCode::FileNotFound, message: "File not found.".to_string() }
    );
}

#[tokio::test]
async fn shutdown_closes_abandoned_sessions() {
    let root = TempDir::new("tftp").unwrap();
    let block = vec![0x55; 512];
    let (mut server, addr) = start_server(&root);

    let client = async {
        let client = Client::new(addr).await;
        client.send(Request::WriteReq { path: "partial.bin".to_string() }).await;
        assert_eq!(client.recv().await, Request::Ack { block: 0 });
        // Walk away after one full block, leaving the upload unfinished.
        client.send(Request::Data { block: 1, data: block.clone() }).await;
        client.recv().await
    };

    let (_, last) = tokio::join!(serve(&mut server, 2), client);
    assert_eq!(last, Request::Ack { block: 1 });
    assert_eq!(server.sessions().len(), 1);

    server.shutdown().await;
    assert_eq!(std::fs::read(root.path().join("partial.bin")).unwrap(), block);
}

#[tokio::test]
async fn oversized_datagram_is_dropped() {
    let root = TempDir::new("tftp").unwrap();
    let (mut server, addr) = start_server(&root);

    let client = async {
        let client = Client::new(addr).await;
        client.sock.send_to(&[0x00; 3000], addr).await.unwrap();
        client
    };

    let (received, client) = tokio::join!(server.serve_one(), client);
    assert!(matches!(received, Err(SocketError::Oversized(src)) if src == client.sock.local_addr().unwrap()));
    assert!(server.sessions().is_empty());

    // The server keeps answering the same peer afterwards.
    let reply = async {
        client.send(Request::Ack { block: 1 }).await;
        client.recv().await
    };
    let (_, reply) = tokio::join!(serve(&mut server, 1), reply);
    assert!(matches!(reply, Request::Error { code: ErrorCode::UnknownTransferId, .. }));
}
