//! RESP2 encoding and parsing.
//!
//! Commands are always encoded as arrays of bulk strings. Replies are read
//! top-down from a buffered async reader; a caller-owned line buffer is
//! reused across reads.

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::pool::PoolError;

/// Largest bulk string a server may send.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Array elements reserved up front. Longer arrays grow as they are read.
const ARRAY_PREALLOC: usize = 1024;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`, `+PONG`.
    Simple(Vec<u8>),
    /// `-ERR ...`.
    Error(Vec<u8>),
    /// `:123`.
    Integer(i64),
    /// `$...`, `None` for the null bulk string.
    Bulk(Option<Vec<u8>>),
    /// `*...`, `None` for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(s) if s == b"OK")
    }
}

/// Encode a command into `out`.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Read one reply.
pub fn read_value<'a, R>(
    reader: &'a mut R,
    line: &'a mut Vec<u8>,
) -> BoxFuture<'a, Result<RespValue, PoolError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        read_line(reader, line).await?;
        let (kind, rest) = match line.split_first() {
            Some((kind, rest)) => (*kind, rest),
            None => return Err(PoolError::Protocol("empty reply line".to_string())),
        };

        match kind {
            b'+' => Ok(RespValue::Simple(rest.to_vec())),
            b'-' => Ok(RespValue::Error(rest.to_vec())),
            b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
            b'$' => {
                let len = parse_i64(rest)?;
                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                if len > MAX_BULK_LEN {
                    return Err(PoolError::Protocol(format!(
                        "bulk length {} exceeds {}",
                        len, MAX_BULK_LEN
                    )));
                }
                let mut data = vec![0u8; len as usize + 2];
                reader.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    return Err(PoolError::Protocol("bulk string not terminated".to_string()));
                }
                data.truncate(len as usize);
                Ok(RespValue::Bulk(Some(data)))
            }
            b'*' => {
                let len = parse_i64(rest)?;
                if len < 0 {
                    return Ok(RespValue::Array(None));
                }
                let mut items = Vec::with_capacity((len as usize).min(ARRAY_PREALLOC));
                for _ in 0..len {
                    items.push(read_value(&mut *reader, &mut *line).await?);
                }
                Ok(RespValue::Array(Some(items)))
            }
            other => Err(PoolError::Protocol(format!(
                "unknown reply type byte 0x{:02x}",
                other
            ))),
        }
    })
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), PoolError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = reader.read_until(b'\n', line).await?;
    if read == 0 {
        return Err(PoolError::Protocol("connection closed by peer".to_string()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(PoolError::Protocol("reply line not CRLF terminated".to_string()));
    }
    line.truncate(line.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> Result<i64, PoolError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PoolError::Protocol(format!("invalid integer '{}'", String::from_utf8_lossy(data))))
}
