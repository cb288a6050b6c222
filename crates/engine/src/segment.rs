//! Splitting payloads into segment messages and reassembling them.
//!
//! A segmented payload is a run of messages sharing a `segmentId` header,
//! numbered by `segmentIndex` from zero, with `isLastSegment` set on the
//! final one. The presence of `segmentIndex` is what marks a message as a
//! segment; messages without it bypass reassembly.

use std::fmt::{self, Debug, Formatter};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use courier_transport::Headers;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Header carrying the id shared by every segment of one payload.
pub const SEGMENT_ID: &str = "segmentId";

/// Header carrying the zero-based position of a segment.
pub const SEGMENT_INDEX: &str = "segmentIndex";

/// Header set to `true` on the final segment.
pub const IS_LAST_SEGMENT: &str = "isLastSegment";

/// Headers the engine owns. They are stripped from caller-supplied headers.
pub const RESERVED_HEADERS: [&str; 3] = [SEGMENT_ID, SEGMENT_INDEX, IS_LAST_SEGMENT];

/// The body of a produce call.
pub enum Payload {
    /// A single buffer. Split into segments when larger than the engine's segment size.
    Buffer(Bytes),

    /// A stream of chunks, each sent as one segment.
    Stream(BoxStream<'static, Bytes>),
}

impl Payload {
    /// Wraps a stream of chunks.
    pub fn stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        Self::Stream(chunks.boxed())
    }

    /// Decides how the payload goes on the wire.
    pub(crate) fn prepare(self, segment_size: usize) -> Prepared {
        match self {
            Self::Buffer(content) if content.len() <= segment_size => Prepared::Single(content),
            Self::Buffer(content) => {
                Prepared::Segmented(stream::iter(split(content, segment_size)).boxed())
            }
            Self::Stream(chunks) => Prepared::Segmented(chunks),
        }
    }
}

pub(crate) enum Prepared {
    Single(Bytes),
    Segmented(BoxStream<'static, Bytes>),
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(content) => f.debug_tuple("Buffer").field(&content.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(content: Bytes) -> Self {
        Self::Buffer(content)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(content: Vec<u8>) -> Self {
        Self::Buffer(content.into())
    }
}

impl From<String> for Payload {
    fn from(content: String) -> Self {
        Self::Buffer(content.into())
    }
}

impl From<&'static str> for Payload {
    fn from(content: &'static str) -> Self {
        Self::Buffer(Bytes::from_static(content.as_bytes()))
    }
}

fn split(mut content: Bytes, segment_size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(content.len().div_ceil(segment_size));
    while content.len() > segment_size {
        chunks.push(content.split_to(segment_size));
    }
    chunks.push(content);
    chunks
}

/// Segment position read from message headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Shared id of the payload.
    pub segment_id: String,

    /// Position within the payload.
    pub index: u64,

    /// Whether this is the final segment.
    pub is_last: bool,
}

impl SegmentHeader {
    /// Writes this position into `headers`.
    pub fn apply(&self, headers: &mut Headers) {
        headers.insert(SEGMENT_ID, self.segment_id.clone());
        headers.insert(SEGMENT_INDEX, self.index);
        headers.insert(IS_LAST_SEGMENT, self.is_last);
    }

    /// Reads a segment position.
    ///
    /// Returns `Ok(None)` for ordinary messages.
    ///
    /// # Errors
    ///
    /// Returns a [`ReassemblyError::Malformed`] when `segmentIndex` is present
    /// but the headers do not describe a valid segment.
    pub fn parse(headers: &Headers) -> Result<Option<Self>, ReassemblyError> {
        let Some(raw_index) = headers.get(SEGMENT_INDEX) else {
            return Ok(None);
        };

        let index = raw_index
            .as_u64()
            .ok_or_else(|| ReassemblyError::Malformed(format!("{SEGMENT_INDEX} is {raw_index}")))?;
        let segment_id = headers
            .get_str(SEGMENT_ID)
            .ok_or_else(|| ReassemblyError::Malformed(format!("{SEGMENT_ID} is missing")))?
            .to_string();
        let is_last = headers.get_bool(IS_LAST_SEGMENT).unwrap_or(false);

        Ok(Some(Self {
            segment_id,
            index,
            is_last,
        }))
    }
}

/// Removes engine-owned headers from caller-supplied ones.
pub fn strip_reserved(headers: &mut Headers) {
    for key in RESERVED_HEADERS {
        headers.remove(key);
    }
}

/// Ways a segmented payload can fail to reassemble.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A segment arrived out of order.
    #[error("segment {segment_id} expected index {expected} but received {received}")]
    Gap {
        /// Payload id.
        segment_id: String,
        /// Index that should have come next.
        expected: u64,
        /// Index that arrived.
        received: u64,
    },

    /// Segment headers could not be read.
    #[error("malformed segment headers: {0}")]
    Malformed(String),

    /// No last segment arrived before the stream was abandoned.
    #[error("segment {segment_id} abandoned after {received} segments")]
    Incomplete {
        /// Payload id.
        segment_id: String,
        /// Segments delivered before it was abandoned.
        received: u64,
    },
}

/// One reassembled segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Position within the payload.
    pub index: u64,

    /// Whether this is the final segment.
    pub is_last: bool,

    /// Segment content.
    pub content: Bytes,
}

/// The reassembled sequence of one segmented payload, in index order.
///
/// Ends after the last segment, or after yielding a [`ReassemblyError`].
pub struct PayloadStream {
    inner: UnboundedReceiverStream<Result<Segment, ReassemblyError>>,
}

impl PayloadStream {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<Result<Segment, ReassemblyError>>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                inner: UnboundedReceiverStream::new(receiver),
            },
        )
    }

    /// Reads the whole payload into one buffer.
    ///
    /// # Errors
    ///
    /// Returns the first reassembly error, or a malformed error when the stream ends
    /// before the last segment.
    pub async fn into_bytes(mut self) -> Result<Bytes, ReassemblyError> {
        let mut buffer = BytesMut::new();
        let mut expected = 0;

        while let Some(segment) = self.next().await {
            let segment = segment?;
            buffer.extend_from_slice(&segment.content);
            expected = segment.index + 1;
            if segment.is_last {
                return Ok(buffer.freeze());
            }
        }

        Err(ReassemblyError::Malformed(format!(
            "stream ended before the last segment (next index {expected})"
        )))
    }
}

impl Debug for PayloadStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadStream").finish_non_exhaustive()
    }
}

impl Stream for PayloadStream {
    type Item = Result<Segment, ReassemblyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_buffer_stays_ordinary() {
        let payload = Payload::from("short");
        assert!(matches!(payload.prepare(16), Prepared::Single(_)));
    }

    #[tokio::test]
    async fn test_oversized_buffer_splits_at_segment_size() {
        let payload = Payload::from(vec![7u8; 10]);
        let Prepared::Segmented(chunks) = payload.prepare(4) else {
            panic!("expected a segmented payload");
        };
        let chunks: Vec<Bytes> = chunks.collect().await;
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_header_presence_is_the_discriminator() {
        let ordinary = Headers::new().with(SEGMENT_ID, "abc");
        assert_eq!(SegmentHeader::parse(&ordinary), Ok(None));

        let mut headers = Headers::new().with("tenant", "acme");
        SegmentHeader {
            segment_id: "abc".to_string(),
            index: 2,
            is_last: true,
        }
        .apply(&mut headers);

        let parsed = SegmentHeader::parse(&headers).unwrap().unwrap();
        assert_eq!(parsed.index, 2);
        assert!(parsed.is_last);

        strip_reserved(&mut headers);
        assert_eq!(headers, Headers::new().with("tenant", "acme"));
    }

    #[test]
    fn test_malformed_index_is_reported() {
        let headers = Headers::new()
            .with(SEGMENT_ID, "abc")
            .with(SEGMENT_INDEX, "first");
        assert!(matches!(
            SegmentHeader::parse(&headers),
            Err(ReassemblyError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_stream_into_bytes() {
        let (sender, stream) = PayloadStream::channel();
        for (index, part) in ["ab", "cd", "e"].into_iter().enumerate() {
            sender
                .send(Ok(Segment {
                    index: index as u64,
                    is_last: index == 2,
                    content: Bytes::from_static(part.as_bytes()),
                }))
                .unwrap();
        }
        drop(sender);

        assert_eq!(stream.into_bytes().await.unwrap(), "abcde");
    }
}
