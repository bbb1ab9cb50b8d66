use crate::error::TftpError;
use crate::tftp::{self, Request, Response};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The transfer engine for a single session. Reads stream a file to the peer; writes stream one
/// from it.
#[derive(Debug)]
pub enum PacketProcessor<T> {
    Read(ReadProcessor<T>),
    Write(WriteProcessor<T>),
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Response),

    /// Caller should send the packet and end the session.
    TerminateWithPacket(Response),

    /// Caller should end the session without sending anything.
    CloseConnection,
}

/// An entity that can process packets and produce a response.
impl<T: AsyncRead + AsyncWrite + Unpin> PacketProcessor<T> {
    /// Wraps a stream opened for reading. `size` is the number of bytes the file held when opened.
    pub fn new_for_reading(stream: T, size: u64) -> PacketProcessor<T> {
        PacketProcessor::Read(ReadProcessor::new(stream, size))
    }

    pub fn new_for_writing(stream: T) -> PacketProcessor<T> {
        PacketProcessor::Write(WriteProcessor::new(stream))
    }

    /// Produces the packet that answers the initial request: the first DATA block for a read, or
    /// ACK 0 for a write.
    pub async fn first_packet(&mut self) -> Result<ResultAction, TftpError> {
        match self {
            PacketProcessor::Read(p) => p.process_ack(0).await,
            PacketProcessor::Write(_) => Ok(ResultAction::SendPacketAndAwait(Response::Ack { block: 0 })),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &Request) -> Result<ResultAction, TftpError> {
        match (self, packet) {
            (PacketProcessor::Read(p), &Request::Ack { block }) => p.process_ack(block).await,
            (PacketProcessor::Write(p), Request::Data { block, data }) => p.process_data(*block, data).await,
            (PacketProcessor::Read(_), _) => Err(TftpError::illegal(format!(
                "Expected to receive an Ack packet, but got {packet} instead"
            ))),
            (PacketProcessor::Write(_), _) => Err(TftpError::illegal(format!(
                "Expected to receive a Data packet, but got {packet} instead"
            ))),
        }
    }

    /// Releases the stream, making sure everything written so far reaches storage.
    pub async fn close(self) -> Result<(), io::Error> {
        match self {
            PacketProcessor::Read(_) => Ok(()),
            PacketProcessor::Write(mut p) => p.stream.shutdown().await,
        }
    }
}

#[derive(Debug)]
pub struct ReadProcessor<T> {
    stream: T,
    block_size: usize,
    bytes_remaining: u64,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl<T: AsyncRead + Unpin> ReadProcessor<T> {
    fn new(stream: T, size: u64) -> ReadProcessor<T> {
        ReadProcessor {
            stream,
            block_size: tftp::DATA_BUFFER_SIZE,
            bytes_remaining: size,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    async fn process_ack(&mut self, block: u16) -> Result<ResultAction, TftpError> {
        if block != self.curr_block {
            return Err(TftpError::illegal(format!(
                "Expected an ack for block {cb}, but received an ack for {block}",
                cb = self.curr_block
            )));
        }

        if self.awaiting_final_ack {
            return Ok(ResultAction::CloseConnection);
        }

        // Never send past the size recorded at open, even if the file has grown since.
        let limit = usize::try_from(self.bytes_remaining).map_or(self.block_size, |r| r.min(self.block_size));
        let data = read_block(&mut self.stream, limit).await?;
        self.bytes_remaining -= data.len() as u64;

        if data.len() < self.block_size {
            if self.bytes_remaining > 0 {
                return Err(TftpError::undefined(format!(
                    "File ended early, {} bytes short of its reported size",
                    self.bytes_remaining
                )));
            }
            self.awaiting_final_ack = true;
        }

        // Block numbers wrap modulo 2^16, so transfers of any length are possible.
        self.curr_block = self.curr_block.wrapping_add(1);
        Ok(ResultAction::SendPacketAndAwait(Response::Data { block: self.curr_block, data }))
    }
}

async fn read_block<R: AsyncRead + Unpin>(f: &mut R, limit: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; limit];
    let mut cursor = 0;

    // A single call to read may return fewer bytes than asked for, so keep reading into the rest of
    // the buffer until it is full or the stream is exhausted.
    while cursor < buf.len() {
        match f.read(&mut buf[cursor..]).await? {
            0 => break,
            s => cursor += s,
        }
    }

    buf.truncate(cursor);
    Ok(buf)
}

#[derive(Debug)]
pub struct WriteProcessor<T> {
    stream: T,
    block_size: usize,
    curr_block: u16,
}

impl<T: AsyncWrite + Unpin> WriteProcessor<T> {
    fn new(stream: T) -> WriteProcessor<T> {
        WriteProcessor { stream, block_size: tftp::DATA_BUFFER_SIZE, curr_block: 0 }
    }

    async fn process_data(&mut self, block: u16, data: &[u8]) -> Result<ResultAction, TftpError> {
        let expected = self.curr_block.wrapping_add(1);
        if block != expected {
            return Err(TftpError::illegal(format!(
                "Data blocks must be received by the server in sequence. Server received data for block {block}, \
                but expected block {expected}."
            )));
        }

        if data.len() > self.block_size {
            return Err(TftpError::illegal(format!(
                "Data block {block} carries {} bytes, more than the block size of {}",
                data.len(),
                self.block_size
            )));
        }

        self.stream.write_all(data).await?;
        self.curr_block = block;
        let packet = Response::Ack { block };

        if data.len() < self.block_size {
            self.stream.flush().await?;
            Ok(ResultAction::TerminateWithPacket(packet))
        } else {
            Ok(ResultAction::SendPacketAndAwait(packet))
        }
    }
}
