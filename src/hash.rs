use blake2::{Blake2b512, Digest};
use tokio::io::{AsyncRead, AsyncReadExt};

// Chunks are hashed in blocks of this size so we never hold more than
// ~100 MB of a chunk in memory at once.
const READ_BLOCK_SIZE: usize = 100 * 1000 * 1000;

/// Streams up to `limit` bytes from `reader` through Blake2b-512 and returns
/// the lowercase-hex digest. The reader is consumed exactly up to `limit` or
/// EOF, whichever comes first.
pub async fn hash_chunk<R>(reader: R, limit: u64) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(limit);
    let mut hasher = Blake2b512::new();
    let buf_size = READ_BLOCK_SIZE.min(usize::try_from(limit).unwrap_or(READ_BLOCK_SIZE).max(1));
    let mut buffer = vec![0u8; buf_size];
    loop {
        let read = limited.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
