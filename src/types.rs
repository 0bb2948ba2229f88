use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Chain identifier, e.g. `8453` for Base.
///
/// Strongly typed so chain ids are not mixed up with block positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP method used for webhook delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Destination for forwarded events.
///
/// A pure configuration object; the forwarder merges `headers` over a
/// default `content-type: application/json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    /// Target URL.
    pub url: String,

    /// HTTP method, POST when omitted.
    #[serde(default)]
    pub method: HttpMethod,

    /// Extra headers. These win over the default content type.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Webhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// One independently resumable (query, chain, webhook, cursor) unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Name used in every log line for this subscription.
    pub name: String,

    pub chain_id: ChainId,

    /// Query passed through to the streaming source untouched.
    pub query: String,

    /// Event signatures passed through to the streaming source untouched.
    #[serde(default)]
    pub signatures: Vec<String>,

    pub webhook: Webhook,

    /// Where the last persisted position lives.
    pub cursor_file: PathBuf,

    /// Start here when no cursor file exists. Zero when unset.
    #[serde(default)]
    pub initial_block: Option<u64>,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        chain_id: u64,
        query: impl Into<String>,
        webhook: Webhook,
        cursor_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            chain_id: ChainId(chain_id),
            query: query.into(),
            signatures: Vec::new(),
            webhook,
            cursor_file: cursor_file.into(),
            initial_block: None,
        }
    }

    pub fn with_signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signatures = signatures.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_initial_block(mut self, block: u64) -> Self {
        self.initial_block = Some(block);
        self
    }

    /// Position to start from when no usable cursor is stored.
    pub fn fallback_position(&self) -> u64 {
        self.initial_block.unwrap_or(0)
    }
}

/// Wire name for a payload field that was itself called `cursor`.
pub const SOURCE_CURSOR_KEY: &str = "source_cursor";

/// One item from a live stream.
///
/// The payload is opaque and forwarded verbatim; the cursor mapping is
/// serialized alongside it so receivers can see which block they got.
/// A payload field named `cursor` goes out as [`SOURCE_CURSOR_KEY`] so it
/// cannot shadow the mapping.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Event {
    /// Position reached per chain once this event is consumed.
    #[serde(default, deserialize_with = "deserialize_cursor")]
    pub cursor: BTreeMap<ChainId, u64>,

    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(payload: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            cursor: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_position(mut self, chain_id: ChainId, position: u64) -> Self {
        self.cursor.insert(chain_id, position);
        self
    }

    /// Position for `chain_id`, if this event carries one.
    pub fn position(&self, chain_id: ChainId) -> Option<u64> {
        self.cursor.get(&chain_id).copied()
    }
}

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.payload.len() + 1))?;
        map.serialize_entry("cursor", &self.cursor)?;
        for (key, value) in &self.payload {
            let key = if key == "cursor" { SOURCE_CURSOR_KEY } else { key.as_str() };
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Chain ids arrive as string map keys, which `flatten` will not coerce.
fn deserialize_cursor<'de, D>(deserializer: D) -> Result<BTreeMap<ChainId, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    BTreeMap::<String, u64>::deserialize(deserializer)?
        .into_iter()
        .map(|(chain, position)| {
            chain
                .trim()
                .parse()
                .map(|chain| (ChainId(chain), position))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}
