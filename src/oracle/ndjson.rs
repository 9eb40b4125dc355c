//! Newline-delimited JSON fragments from a streaming generate response.
//!
//! [`Fragments`] is a pull-based, single-pass reader: every call to
//! [`Fragments::next_fragment`] decodes the next well-formed line. Lines that
//! fail to decode are skipped; read failures end the sequence with an error.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

/// Longest line accepted from the upstream, excluding the newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// One line of the upstream stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream read failed: {0}")]
    Read(String),
    #[error("stream line exceeds {} bytes", MAX_LINE_BYTES)]
    LineTooLong,
}

pub struct Fragments<S> {
    inner: Pin<Box<S>>,
    buf: BytesMut,
    // Bytes of `buf` already known not to contain a newline.
    scanned: usize,
    exhausted: bool,
}

impl<S, E> Fragments<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
            buf: BytesMut::new(),
            scanned: 0,
            exhausted: false,
        }
    }

    pub async fn next_fragment(&mut self) -> Option<Result<Fragment, StreamError>> {
        loop {
            let line = match self.next_line().await? {
                Ok(line) => line,
                Err(err) => return Some(Err(err)),
            };
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Fragment>(line) {
                Ok(fragment) => return Some(Ok(fragment)),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping malformed stream line");
                }
            }
        }
    }

    async fn next_line(&mut self) -> Option<Result<Bytes, StreamError>> {
        loop {
            if let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                let end = self.scanned + offset;
                self.scanned = 0;
                if end > MAX_LINE_BYTES {
                    return Some(Err(self.fail(StreamError::LineTooLong)));
                }
                return Some(Ok(self.buf.split_to(end + 1).freeze()));
            }
            self.scanned = self.buf.len();
            if self.buf.len() > MAX_LINE_BYTES {
                return Some(Err(self.fail(StreamError::LineTooLong)));
            }
            if self.exhausted {
                if self.buf.is_empty() {
                    return None;
                }
                self.scanned = 0;
                return Some(Ok(self.buf.split().freeze()));
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(err)) => return Some(Err(self.fail(StreamError::Read(err.to_string())))),
                None => self.exhausted = true,
            }
        }
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        self.exhausted = true;
        self.buf.clear();
        self.scanned = 0;
        err
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Concatenates fragment text in arrival order until a fragment reports
/// `done` or the stream ends.
pub async fn aggregate<S, E>(stream: S) -> Result<String, StreamError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut fragments = Fragments::new(stream);
    let mut answer = String::new();
    while let Some(fragment) = fragments.next_fragment().await {
        let fragment = fragment?;
        answer.push_str(&fragment.response);
        if fragment.done {
            break;
        }
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn joins_fragments_until_done() {
        let body = chunks(&[
            "{\"response\":\"Ye\",\"done\":false}\n",
            "{\"response\":\"s.\",\"done\":true}\n",
            "{\"response\":\" ignored\",\"done\":false}\n",
        ]);
        assert_eq!(aggregate(body).await.unwrap(), "Yes.");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let body = chunks(&[
            "{not json}\n",
            "{\"response\":\"No\",\"done\":false}\n",
            "\n",
            "{\"response\":\".\",\"done\":true}\n",
        ]);
        assert_eq!(aggregate(body).await.unwrap(), "No.");
    }

    #[tokio::test]
    async fn lines_split_across_chunks() {
        let body = chunks(&[
            "{\"respon",
            "se\":\"Good\",\"do",
            "ne\":false}\r\n{\"response\":\"bye.\"",
            ",\"done\":true}",
        ]);
        assert_eq!(aggregate(body).await.unwrap(), "Goodbye.");
    }

    #[tokio::test]
    async fn stream_end_without_done_keeps_text() {
        let body = chunks(&["{\"response\":\"Maybe\"}\n"]);
        assert_eq!(aggregate(body).await.unwrap(), "Maybe");
    }

    #[tokio::test]
    async fn read_error_is_reported() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"response\":\"Ye\",\"done\":false}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let err = aggregate(stream::iter(parts)).await.unwrap_err();
        assert!(matches!(err, StreamError::Read(_)));
    }

    #[tokio::test]
    async fn oversized_line_is_an_error() {
        let long = "x".repeat(MAX_LINE_BYTES + 10);
        let body = chunks(&[long.as_str()]);
        assert_eq!(aggregate(body).await.unwrap_err(), StreamError::LineTooLong);
    }

    #[tokio::test]
    async fn fragments_yield_in_order_then_end() {
        let mut fragments = Fragments::new(chunks(&[
            "{\"response\":\"a\"}\n{\"response\":\"b\",\"done\":true}\n",
        ]));
        let first = fragments.next_fragment().await.unwrap().unwrap();
        assert_eq!(first.response, "a");
        assert!(!first.done);
        let second = fragments.next_fragment().await.unwrap().unwrap();
        assert!(second.done);
        assert!(fragments.next_fragment().await.is_none());
    }
}
