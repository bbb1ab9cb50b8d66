// Wire format for TFTP (RFC 1350) packets and the UDP socket they travel over.
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ/WRQ:  opcode | Filename | 0x00 | Mode | 0x00
// DATA:     opcode | Block # (2 bytes) | Data (0-512 bytes)
// ACK:      opcode | Block # (2 bytes)
// ERROR:    opcode | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// Only "octet" mode is served. Anything else is rejected while decoding.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Maximum payload carried by a single DATA packet.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Size of the fixed header shared by DATA, ACK and ERROR packets.
pub const HEADER_SIZE: usize = 4;

/// Size of the receive buffer. Larger than any legal packet so oversized DATA can be detected.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// The only transfer mode this server understands.
pub const OCTET_MODE: &str = "octet";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a datagram that could not be decoded into a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The datagram is truncated or a string is missing its terminator.
    Malformed(String),

    /// The request asked for a transfer mode other than octet.
    UnsupportedMode(String),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Malformed(msg) => write!(f, "Malformed packet: {msg}"),
            PacketError::UnsupportedMode(mode) => write!(
                f,
                "Incorrect mode '{mode}'. This server supports only '{OCTET_MODE}' mode."
            ),
        }
    }
}

type PacketResult<T> = Result<T, PacketError>;

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),

    /// A datagram from this peer filled the whole receive buffer, so it may have been cut short.
    /// No legal TFTP packet is that large.
    Oversized(SocketAddr),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::Oversized(src) => write!(f, "Datagram from {src} does not fit the receive buffer"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

pub type SocketResult<T> = Result<T, SocketError>;

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Decodes a wire error code. Values outside the table are treated as Undefined.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    /// The canonical human-readable message. Undefined has none; its message is supplied by the
    /// caller.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Undefined => "",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransferId => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// The five opcodes defined by RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }
}

/// A decoded inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,
    },

    /// A write request packet
    WriteReq {
        path: String,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },

    /// A packet whose opcode is not one of the five legal values. The rest of the datagram is
    /// never looked at.
    Unknown {
        opcode: u16,
    },
}

/// An outbound packet produced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Data { block: u16, data: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

///////////////////////////////////////////////////////////////
// Primitive codec

/// Appends `s` followed by a terminating 0 byte. Anything after an embedded 0 byte is dropped,
/// since a receiver would stop reading there anyway.
pub fn encode_string(s: &str, out: &mut Vec<u8>) {
    let bytes = s.as_bytes();
    let end = bytes.iter().position(|&b| b == 0x00).unwrap_or(bytes.len());
    out.extend_from_slice(&bytes[..end]);
    out.push(0x00);
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and reads until the
/// first 0 byte.
///
/// Returns the number of bytes consumed (terminator included) along with the string.
pub fn decode_string(buf: &[u8]) -> PacketResult<(usize, String)> {
    match buf.iter().position(|&b| b == 0x00) {
        Some(end) => Ok((end + 1, String::from_utf8_lossy(&buf[..end]).into_owned())),
        None => Err(PacketError::Malformed(
            "string is not terminated with a null byte".to_string(),
        )),
    }
}

/// Builds the fixed 4-byte header: opcode followed by a block number or error code.
pub fn encode_header(opcode: OpCode, number: u16) -> [u8; HEADER_SIZE] {
    let op = (opcode as u16).to_be_bytes();
    let num = number.to_be_bytes();
    [op[0], op[1], num[0], num[1]]
}

/// Splits the raw opcode off the front of a datagram.
pub fn decode_opcode(buf: &[u8]) -> PacketResult<(u16, &[u8])> {
    split_u16(buf)
        .ok_or_else(|| PacketError::Malformed("packet is too short to hold an opcode".to_string()))
}

fn split_u16(buf: &[u8]) -> Option<(u16, &[u8])> {
    if buf.len() < 2 {
        return None;
    }
    Some((u16::from_be_bytes([buf[0], buf[1]]), &buf[2..]))
}

fn split_number<'a>(buf: &'a [u8], what: &str) -> PacketResult<(u16, &'a [u8])> {
    split_u16(buf).ok_or_else(|| PacketError::Malformed(format!("packet is too short to hold a {what}")))
}

///////////////////////////////////////////////////////////////
// Request decoding

fn parse_path(buf: &[u8]) -> PacketResult<String> {
    let (path_len, path) = decode_string(buf)?;
    let (_, mode) = decode_string(&buf[path_len..])
        .map_err(|_| PacketError::Malformed("request does not contain a terminated mode".to_string()))?;

    if mode != OCTET_MODE {
        return Err(PacketError::UnsupportedMode(mode));
    }

    Ok(path)
}

impl Request {
    /// Decodes a datagram. `buf` must be exactly the bytes received, so that stale contents of a
    /// reused receive buffer never leak into a DATA payload.
    pub fn parse_from_buf(buf: &[u8]) -> PacketResult<Request> {
        let (raw_op, body) = decode_opcode(buf)?;

        let op = match OpCode::from_u16(raw_op) {
            Some(op) => op,
            None => return Ok(Request::Unknown { opcode: raw_op }),
        };

        match op {
            OpCode::Rrq => Ok(Request::ReadReq { path: parse_path(body)? }),
            OpCode::Wrq => Ok(Request::WriteReq { path: parse_path(body)? }),
            OpCode::Data => {
                let (block, data) = split_number(body, "block number")?;
                Ok(Request::Data { block, data: data.to_vec() })
            }
            OpCode::Ack => {
                let (block, _) = split_number(body, "block number")?;
                Ok(Request::Ack { block })
            }
            OpCode::Error => {
                let (raw_code, rest) = split_number(body, "error code")?;
                let (_, message) = decode_string(rest)?;
                Ok(Request::Error { code: ErrorCode::from_u16(raw_code), message })
            }
        }
    }

    /// Encodes the packet the way a client would put it on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Request::ReadReq { path } | Request::WriteReq { path } => {
                let op = if matches!(self, Request::ReadReq { .. }) { OpCode::Rrq } else { OpCode::Wrq };
                let mut buf = (op as u16).to_be_bytes().to_vec();
                encode_string(path, &mut buf);
                encode_string(OCTET_MODE, &mut buf);
                buf
            }
            Request::Data { block, data } => {
                let mut buf = encode_header(OpCode::Data, *block).to_vec();
                buf.extend_from_slice(data);
                buf
            }
            Request::Ack { block } => encode_header(OpCode::Ack, *block).to_vec(),
            Request::Error { code, message } => {
                let mut buf = encode_header(OpCode::Error, *code as u16).to_vec();
                encode_string(message, &mut buf);
                buf
            }
            Request::Unknown { opcode } => opcode.to_be_bytes().to_vec(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Request::ReadReq { path } => write!(f, "RRQ '{path}'"),
            Request::WriteReq { path } => write!(f, "WRQ '{path}'"),
            Request::Data { block, data } => write!(f, "DATA #{block} ({} bytes)", data.len()),
            Request::Ack { block } => write!(f, "ACK #{block}"),
            Request::Error { code, message } => write!(f, "ERROR {code:?} '{message}'"),
            Request::Unknown { opcode } => write!(f, "unknown opcode {opcode}"),
        }
    }
}

impl Response {
    /// Serializes the response for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Data { block, data } => {
                let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
                buf.extend_from_slice(&encode_header(OpCode::Data, *block));
                buf.extend_from_slice(data);
                buf
            }
            Response::Ack { block } => encode_header(OpCode::Ack, *block).to_vec(),
            Response::Error { code, message } => {
                let mut buf = encode_header(OpCode::Error, *code as u16).to_vec();
                encode_string(message, &mut buf);
                buf
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that sends TFTP responses and hands back raw datagrams.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> SocketResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    /// Receives one datagram into `buf`, returning its length and sender. A datagram that fills
    /// `buf` completely is reported as oversized rather than handed back possibly truncated.
    pub async fn recv(&self, buf: &mut [u8]) -> SocketResult<(usize, SocketAddr)> {
        let (total_read, src) = self.sock.recv_from(buf).await?;
        if total_read == buf.len() {
            return Err(SocketError::Oversized(src));
        }
        Ok((total_read, src))
    }

    pub async fn send(&self, packet: &Response, dst: SocketAddr) -> SocketResult<usize> {
        Ok(self.sock.send_to(&packet.to_bytes(), dst).await?)
    }
}
