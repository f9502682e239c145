use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Splits `stream` into chunks of exactly `chunk_size` bytes.
///
/// Only the last chunk may be shorter. An empty input yields no chunks at all.
pub fn chunk_stream(
    chunk_size: u32,
    mut stream: impl AsyncRead + Unpin,
) -> impl Stream<Item = std::io::Result<Vec<u8>>> {
    async_stream::try_stream! {
        loop {
            let mut stream_chunk = (&mut stream).take(chunk_size as u64);

            let mut data = Vec::with_capacity(chunk_size as usize);
            let chunk_len = stream_chunk.read_to_end(&mut data).await?;
            if chunk_len == 0 {
                break;
            }
            yield data;

            if chunk_len < chunk_size as usize {
                break;
            }
        }
    }
}
