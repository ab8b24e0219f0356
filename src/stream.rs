//! The inbound byte stream type and constructors for it.

use std::fmt::Display;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};

/// An ordered, finite sequence of byte chunks carrying one email.
///
/// Read exactly once, front to back. Whoever consumes it takes it by value,
/// so the underlying reader is dropped on every exit path.
pub type RawMessageStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A stream that yields `bytes` as a single chunk.
pub fn from_bytes(bytes: impl Into<Bytes>) -> RawMessageStream {
    let chunk: Bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(chunk) }))
}

/// A stream that yields each item of `chunks` in order.
pub fn from_chunks<I, C>(chunks: I) -> RawMessageStream
where
    I: IntoIterator<Item = C>,
    I::IntoIter: Send + 'static,
    C: Into<Bytes>,
{
    Box::pin(futures::stream::iter(
        chunks.into_iter().map(|c| Ok::<Bytes, io::Error>(c.into())),
    ))
}

/// Adapt any fallible byte stream (an HTTP request body, for one) into a
/// [`RawMessageStream`]. Source errors become `io::Error`s.
pub fn from_fallible<S, E>(source: S) -> RawMessageStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display,
{
    Box::pin(source.map(|item| item.map_err(|e| io::Error::other(e.to_string()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_chunks_preserves_order_and_empty_chunks() {
        let stream = from_chunks(vec![b"ab".to_vec(), Vec::new(), b"c".to_vec()]);
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..], b"ab");
        assert!(chunks[1].is_empty());
        assert_eq!(&chunks[2][..], b"c");
    }

    #[tokio::test]
    async fn from_fallible_maps_errors() {
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"x")),
            Err("socket reset"),
        ]);
        let items: Vec<io::Result<Bytes>> = from_fallible(source).collect().await;
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "socket reset");
    }
}
