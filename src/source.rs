//! Live event sources.
//!
//! The runner only sees [`EventSource`]: open a stream at a position, read
//! events until it fails. [`LiveQueryClient`] implements it over the Index
//! Supply live query endpoint, which answers with server-sent events.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::types::{ChainId, Event};

pub const DEFAULT_API_URL: &str = "https://api.indexsupply.net";

/// Unbounded stream of events. An `Err` item ends the connection.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Everything a source needs to open one live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub api_key: String,
    pub chain_id: ChainId,
    pub query: String,
    pub signatures: Vec<String>,
    /// Resume point, read from the cursor store right before opening.
    pub start_position: u64,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, request: StreamRequest) -> Result<EventStream>;
}

/// Index Supply live query client.
#[derive(Debug, Clone)]
pub struct LiveQueryClient {
    client: reqwest::Client,
    base_url: String,
}

impl LiveQueryClient {
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::HttpClient(e.to_string()))?;
        Ok(Self::with_client(client, base_url.unwrap_or(DEFAULT_API_URL)))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EventSource for LiveQueryClient {
    async fn open(&self, request: StreamRequest) -> Result<EventStream> {
        let mut params = vec![
            ("api-key", request.api_key.clone()),
            ("chain", request.chain_id.to_string()),
            ("query", request.query.clone()),
            ("block_height", request.start_position.to_string()),
        ];
        for signature in &request.signatures {
            params.push(("event_signatures", signature.clone()));
        }

        let response = self
            .client
            .get(format!("{}/query-live", self.base_url))
            .query(&params)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| RelayError::stream_open(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::stream_open(format!("status {}: {}", status.as_u16(), body)));
        }

        debug!(chain_id = %request.chain_id, start = request.start_position, "live query opened");
        Ok(Box::pin(decode_events(Box::pin(response.bytes_stream()), request.chain_id)))
    }
}

struct DecodeState<S> {
    body: S,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    failed: bool,
}

/// Turns a raw SSE body into events carrying `chain_id`'s position.
fn decode_events<S, B>(body: S, chain_id: ChainId) -> impl Stream<Item = Result<Event>> + Send
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
{
    let state = DecodeState {
        body,
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        failed: false,
    };

    futures::stream::unfold(state, move |mut state| async move {
        if state.failed {
            return None;
        }
        loop {
            if let Some(data) = state.ready.pop_front() {
                let item = parse_frame(chain_id, &data);
                return Some((item, state));
            }
            match state.body.next().await {
                Some(Ok(chunk)) => match state.decoder.push(chunk.as_ref()) {
                    Ok(frames) => state.ready.extend(frames),
                    Err(err) => {
                        state.failed = true;
                        return Some((Err(err), state));
                    }
                },
                Some(Err(err)) => {
                    state.failed = true;
                    return Some((Err(RelayError::stream(err.to_string())), state));
                }
                None => return None,
            }
        }
    })
}

/// A frame is a JSON object; its `block_height` becomes the cursor.
fn parse_frame(chain_id: ChainId, data: &str) -> Result<Event> {
    let payload: serde_json::Map<String, serde_json::Value> = serde_json::from_str(data)
        .map_err(|e| RelayError::stream(format!("invalid frame: {e}")))?;

    let height = payload.get("block_height").and_then(serde_json::Value::as_u64);
    let event = Event::new(payload);
    Ok(match height {
        Some(height) => event.with_position(chain_id, height),
        None => event,
    })
}

/// Largest frame the decoder will buffer before failing the stream.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Incremental server-sent events decoder yielding `data` fields.
///
/// Bytes already searched for a frame boundary are not searched again, so
/// a frame arriving in many small chunks decodes in linear time.
#[derive(Debug)]
struct SseDecoder {
    buffer: Vec<u8>,
    scanned: usize,
    max_frame: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    fn with_limit(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        let mut start = 0;
        // A boundary can straddle the previous chunk's last byte.
        let mut from = self.scanned.saturating_sub(1);
        while let Some(offset) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") {
            let end = from + offset;
            if let Some(data) = frame_data(&self.buffer[start..end]) {
                frames.push(data);
            }
            start = end + 2;
            from = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_frame {
            return Err(RelayError::stream(format!(
                "frame exceeds {} bytes",
                self.max_frame
            )));
        }
        Ok(frames)
    }
}

fn frame_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn decoder_handles_split_chunks_and_comments() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.push(b": keep-alive\n\ndata: {\"block_he").unwrap().is_empty());
        assert_eq!(
            decoder.push(b"ight\":1}\r\n\r\n").unwrap(),
            vec![r#"{"block_height":1}"#.to_string()]
        );
        assert_eq!(
            decoder.push(b"event: x\ndata: {\"a\":\ndata: 2}\n\ndata:{}\n\n").unwrap(),
            vec!["{\"a\":\n2}".to_string(), "{}".to_string()]
        );
    }

    #[test]
    fn boundary_split_across_chunks() {
        let mut decoder = SseDecoder::default();

        assert!(decoder.push(b"data: 1\n").unwrap().is_empty());
        assert_eq!(decoder.push(b"\ndata: 2\n").unwrap(), vec!["1".to_string()]);
        assert_eq!(decoder.push(b"\n").unwrap(), vec!["2".to_string()]);
    }

    #[test]
    fn large_frame_in_small_chunks_decodes_in_linear_time() {
        let mut frame = b"data: {\"block_height\": 1, \"blob\": \"".to_vec();
        frame.extend(std::iter::repeat(b'a').take(4 * 1024 * 1024));
        frame.extend_from_slice(b"\"}\n\n");

        let mut decoder = SseDecoder::default();
        let started = std::time::Instant::now();
        let mut frames = Vec::new();
        for chunk in frame.chunks(8 * 1024) {
            frames.extend(decoder.push(chunk).unwrap());
        }

        assert_eq!(frames.len(), 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(parse_frame(ChainId(1), &frames[0]).unwrap().position(ChainId(1)), Some(1));
    }

    #[test]
    fn oversized_frame_fails_the_stream() {
        let mut decoder = SseDecoder::with_limit(16);

        assert!(decoder.push(b"data: 0123456789").unwrap().is_empty());
        let err = decoder.push(b"abcdef").unwrap_err();
        assert!(matches!(err, RelayError::Stream { ref message } if message.contains("16 bytes")));
    }

    #[test]
    fn frame_height_becomes_cursor() {
        let event = parse_frame(ChainId(8453), r#"{"block_height": 19000000, "result": []}"#).unwrap();
        assert_eq!(event.position(ChainId(8453)), Some(19_000_000));
        assert!(event.payload.contains_key("result"));

        let event = parse_frame(ChainId(8453), r#"{"result": []}"#).unwrap();
        assert_eq!(event.position(ChainId(8453)), None);

        assert!(parse_frame(ChainId(8453), "[1, 2]").is_err());
    }

    fn request(start: u64) -> StreamRequest {
        StreamRequest {
            api_key: "key".into(),
            chain_id: ChainId(8453),
            query: "select block_num from transfer".into(),
            signatures: vec!["Transfer(address indexed from, address indexed to, uint tokens)".into()],
            start_position: start,
        }
    }

    #[tokio::test]
    async fn streams_events_from_live_query() {
        let server = MockServer::start().await;
        let body = "data: {\"block_height\": 100, \"result\": []}\n\ndata: {\"block_height\": 101, \"result\": []}\n\n";
        Mock::given(method("GET"))
            .and(path("/query-live"))
            .and(query_param("api-key", "key"))
            .and(query_param("chain", "8453"))
            .and(query_param("block_height", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = LiveQueryClient::new(Some(server.uri().as_str())).unwrap();
        let stream = client.open(request(100)).await.unwrap();
        let events: Vec<_> = stream.collect().await;

        let heights: Vec<_> = events
            .into_iter()
            .map(|e| e.unwrap().position(ChainId(8453)))
            .collect();
        assert_eq!(heights, vec![Some(100), Some(101)]);
    }

    #[tokio::test]
    async fn rejected_open_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = LiveQueryClient::new(Some(server.uri().as_str())).unwrap();
        let err = client.open(request(0)).await.err().unwrap();

        assert!(matches!(err, RelayError::StreamOpen { ref message } if message.contains("401")));
    }
}
