use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Leading bytes of every packet and of the server challenge.
pub const MAGIC: &[u8; 11] = b"UHSGNEHCCPR";

/// MAGIC + i32 code + u32 payload length
pub const HEADER_LEN: usize = MAGIC.len() + 8;

/// Upper bound for a single payload. Anything larger is treated as a framing error.
pub const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

pub const CMD_AUTH: i32 = 0;
pub const CMD_FUNC_LIST: i32 = 100;
pub const CMD_CALL_FUNC: i32 = 200;

pub const REPLY_OK: i32 = 0;
pub const REPLY_CALL_ERROR: i32 = 1;
pub const REPLY_AUTH_FAILED: i32 = -1;
pub const REPLY_BAD_COMMAND: i32 = -2;

/// Commands a client may send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Auth,
    FuncList,
    CallFunc,
}

impl Command {
    pub fn code(self) -> i32 {
        match self {
            Command::Auth => CMD_AUTH,
            Command::FuncList => CMD_FUNC_LIST,
            Command::CallFunc => CMD_CALL_FUNC,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            CMD_AUTH => Some(Command::Auth),
            CMD_FUNC_LIST => Some(Command::FuncList),
            CMD_CALL_FUNC => Some(Command::CallFunc),
            _ => None,
        }
    }
}

/// A single framed packet. `code` is the command on requests and the
/// return code on replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: i32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(code: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    pub fn command(cmd: Command, payload: impl Into<Bytes>) -> Self {
        Self::new(cmd.code(), payload)
    }

    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self::new(REPLY_OK, payload)
    }

    /// Reply carrying an error text
    pub fn error(code: i32, message: impl AsRef<str>) -> Self {
        Self::new(code, Bytes::copy_from_slice(message.as_ref().as_bytes()))
    }

    pub fn is_ok(&self) -> bool {
        self.code == REPLY_OK
    }

    /// Payload interpreted as text, used for handshake and error replies.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(MAGIC);
        dst.put_i32(self.code);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Parsed fixed-size packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub code: i32,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn parse(buf: &[u8], max_payload: u32) -> Result<Self, TransportError> {
        if buf.len() < HEADER_LEN {
            return Err(TransportError::Malformed("short header".to_string()));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(TransportError::Malformed("bad magic".to_string()));
        }
        let mut rest = &buf[MAGIC.len()..HEADER_LEN];
        let code = rest.get_i32();
        let payload_len = rest.get_u32();
        if payload_len > max_payload {
            return Err(TransportError::Malformed(format!(
                "payload length {} exceeds limit {}",
                payload_len, max_payload
            )));
        }
        Ok(Self { code, payload_len })
    }
}

/// Incremental packet decoder over a growable buffer
pub struct PacketCodec {
    buffer: BytesMut,
    max_payload: u32,
}

impl PacketCodec {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_payload: MAX_PAYLOAD_LEN,
        }
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to take one complete packet off the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&mut self) -> Result<Option<Packet>, TransportError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = PacketHeader::parse(&self.buffer[..HEADER_LEN], self.max_payload)?;
        let total = HEADER_LEN + header.payload_len as usize;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(header.payload_len as usize).freeze();
        Ok(Some(Packet {
            code: header.code,
            payload,
        }))
    }
}

/// Write all of `data` before `timeout` elapses.
pub async fn send_data<W>(
    writer: &mut W,
    data: &[u8],
    timeout: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, write_fully(writer, data))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn write_fully<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < data.len() {
        match writer.write(&data[sent..]).await {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => sent += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    loop {
        match writer.flush().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read exactly `len` bytes before `timeout` elapses.
pub async fn recv_data<R>(
    reader: &mut R,
    len: usize,
    timeout: Duration,
) -> Result<BytesMut, TransportError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_fully(reader, len))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn read_fully<R>(reader: &mut R, len: usize) -> Result<BytesMut, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(buf)
}

pub async fn send_packet<W>(
    writer: &mut W,
    packet: &Packet,
    timeout: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    send_data(writer, &packet.encode(), timeout).await
}

/// Read one packet. The deadline applies to the header and the payload separately.
pub async fn recv_packet<R>(reader: &mut R, timeout: Duration) -> Result<Packet, TransportError>
where
    R: AsyncRead + Unpin,
{
    let header = recv_data(reader, HEADER_LEN, timeout).await?;
    let header = PacketHeader::parse(&header, MAX_PAYLOAD_LEN)?;
    let payload = if header.payload_len == 0 {
        Bytes::new()
    } else {
        recv_data(reader, header.payload_len as usize, timeout)
            .await?
            .freeze()
    };
    Ok(Packet {
        code: header.code,
        payload,
    })
}
