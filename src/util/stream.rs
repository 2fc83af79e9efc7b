use std::io;

use aws_sdk_s3::primitives::ByteStream;
use bytes::{Bytes, BytesMut};
use futures::{stream, stream::BoxStream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// A readable byte stream handed back by the read operations.
pub type DataStream = BoxStream<'static, io::Result<Bytes>>;

pub fn from_byte_stream(body: ByteStream) -> DataStream {
    stream::unfold(body, |mut body| async move {
        body.try_next()
            .await
            .map_err(io::Error::other)
            .transpose()
            .map(|chunk| (chunk, body))
    })
    .boxed()
}

pub fn from_reader<R>(reader: R) -> DataStream
where
    R: AsyncRead + Send + 'static,
{
    ReaderStream::new(reader).boxed()
}

pub fn from_bytes(data: Bytes) -> DataStream {
    stream::once(async move { Ok::<_, io::Error>(data) }).boxed()
}

/// Drains a stream into one contiguous buffer.
pub async fn collect(stream: DataStream) -> io::Result<Bytes> {
    let buf = stream
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok::<_, io::Error>(buf)
        })
        .await?;

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_byte_stream() {
        let stream = from_byte_stream(ByteStream::from(b"hello world".to_vec()));
        let bytes = collect(stream).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn test_collect_reader() {
        let reader = io::Cursor::new(vec![7u8; 20_000]);
        let bytes = collect(from_reader(reader)).await.unwrap();
        assert_eq!(bytes.len(), 20_000);
        assert!(bytes.iter().all(|b| *b == 7));
    }

    #[tokio::test]
    async fn test_collect_empty() {
        let bytes = collect(from_bytes(Bytes::new())).await.unwrap();
        assert!(bytes.is_empty());
    }
}
