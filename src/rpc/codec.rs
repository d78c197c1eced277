use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Message, RpcError};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Read one length-prefixed message: a `Content-Length: N` header block
/// terminated by an empty line, then N bytes of UTF-8 JSON. Returns
/// `Ok(None)` on a clean EOF at a message boundary. Partial reads are
/// absorbed by the buffered reader; an oversized body is drained so the
/// stream stays aligned and only the call fails.
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Option<Message>, RpcError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut content_length: Option<usize> = None;
    let mut saw_any_header = false;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return if saw_any_header {
                Err(RpcError::ConnectionClosed)
            } else {
                Ok(None)
            };
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if saw_any_header {
                break;
            }
            // stray blank line between messages
            continue;
        }
        saw_any_header = true;
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| RpcError::InvalidHeader(line.to_owned()))?,
            );
        }
        // Content-Type and any other headers are ignored.
    }

    let length = content_length.ok_or(RpcError::MissingContentLength)?;
    if length > max_size {
        drain(reader, length).await?;
        return Err(RpcError::MessageTooLarge {
            size: length,
            limit: max_size,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    max_size: usize,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin + Send,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > max_size {
        return Err(RpcError::MessageTooLarge {
            size: body.len(),
            limit: max_size,
        });
    }
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

async fn drain<R>(reader: &mut R, mut remaining: usize) -> Result<(), RpcError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        let n = reader.read(&mut chunk[..take]).await?;
        if n == 0 {
            return Err(RpcError::ConnectionClosed);
        }
        remaining -= n;
    }
    Ok(())
}
