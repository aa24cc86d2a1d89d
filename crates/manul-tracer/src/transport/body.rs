//! Response body readers

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::TransportError;

/// Source of response bytes, read either all at once or chunk by chunk
#[async_trait]
pub trait ResponseBody: Send {
    /// Read everything not consumed yet
    async fn read_all(&mut self) -> Result<Bytes, TransportError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Next chunk, `None` once the body is exhausted
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Body held in memory, optionally ending in a stored read failure
#[derive(Debug, Default)]
pub struct BufferedBody {
    data: Option<Bytes>,
    error: Option<TransportError>,
}

impl BufferedBody {
    /// Body with the given bytes
    pub fn new(data: Bytes) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    /// Body whose first read fails with `error`
    pub fn failed(error: TransportError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

#[async_trait]
impl ResponseBody for BufferedBody {
    async fn read_all(&mut self) -> Result<Bytes, TransportError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        Ok(self.data.take().unwrap_or_default())
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        Ok(self.data.take().filter(|data| !data.is_empty()))
    }
}

/// Body delivered as a fixed sequence of chunks
#[derive(Debug, Default)]
pub struct ChunkedBody {
    chunks: VecDeque<Bytes>,
}

impl ChunkedBody {
    /// Body yielding `chunks` in order
    pub fn new(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ResponseBody for ChunkedBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.chunks.pop_front())
    }
}
