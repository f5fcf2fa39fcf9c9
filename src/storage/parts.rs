//! Cutting an upload body into bounded parts.
//!
//! The S3 backend never holds more than one part (plus one incoming chunk)
//! of an upload in memory.  [`PartReader`] accumulates chunks from a
//! [`ByteStream`] until a part is full or the stream ends.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use super::backend::ByteStream;

/// Reads fixed-size parts from a body stream.
pub struct PartReader<'a> {
    body: ByteStream<'a>,
    pending: BytesMut,
    part_size: usize,
    exhausted: bool,
    total: u64,
}

impl<'a> PartReader<'a> {
    pub fn new(body: ByteStream<'a>, part_size: usize) -> Self {
        Self {
            body,
            pending: BytesMut::new(),
            part_size: part_size.max(1),
            exhausted: false,
            total: 0,
        }
    }

    /// Return the next part: exactly `part_size` bytes, or whatever is left
    /// once the stream has ended.  `None` once everything has been handed
    /// out.
    pub async fn next_part(&mut self) -> io::Result<Option<Bytes>> {
        while !self.exhausted && self.pending.len() < self.part_size {
            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.total += chunk.len() as u64;
                    self.pending.extend_from_slice(&chunk);
                }
                None => self.exhausted = true,
            }
        }

        if self.pending.len() >= self.part_size {
            return Ok(Some(self.pending.split_to(self.part_size).freeze()));
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.pending.split().freeze()))
    }

    /// True once the underlying stream has ended and no bytes remain
    /// buffered.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.pending.is_empty()
    }

    /// Bytes read from the body so far.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(chunks: Vec<&'static [u8]>) -> ByteStream<'static> {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    #[tokio::test]
    async fn test_small_body_is_single_part() {
        let mut reader = PartReader::new(body(vec![b"he", b"llo"]), 8);
        let part = reader.next_part().await.unwrap().unwrap();
        assert_eq!(&part[..], b"hello");
        assert!(reader.is_exhausted());
        assert!(reader.next_part().await.unwrap().is_none());
        assert_eq!(reader.total(), 5);
    }

    #[tokio::test]
    async fn test_parts_are_cut_at_part_size() {
        let mut reader = PartReader::new(body(vec![b"abcdef", b"ghij", b"k"]), 4);
        let mut parts = Vec::new();
        while let Some(part) = reader.next_part().await.unwrap() {
            parts.push(part);
        }
        assert_eq!(parts, vec![
            Bytes::from_static(b"abcd"),
            Bytes::from_static(b"efgh"),
            Bytes::from_static(b"ijk"),
        ]);
        assert_eq!(reader.total(), 11);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_tail() {
        let mut reader = PartReader::new(body(vec![b"abcd", b"efgh"]), 4);
        assert_eq!(&reader.next_part().await.unwrap().unwrap()[..], b"abcd");
        assert!(!reader.is_exhausted());
        assert_eq!(&reader.next_part().await.unwrap().unwrap()[..], b"efgh");
        assert!(reader.next_part().await.unwrap().is_none());
        assert!(reader.is_exhausted());
    }

    #[tokio::test]
    async fn test_empty_body() {
        let mut reader = PartReader::new(body(vec![]), 4);
        assert!(reader.next_part().await.unwrap().is_none());
        assert!(reader.is_exhausted());
        assert_eq!(reader.total(), 0);
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let failing: ByteStream<'static> = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]));
        let mut reader = PartReader::new(failing, 16);
        let err = reader.next_part().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
