//! Relay wire protocol.
//!
//! Newline-delimited JSON over the relay's Unix socket. A stub writes exactly
//! one request line and reads exactly one response line:
//!
//! ```text
//! stub  -> relay   {"id":"<uuid>","label":"jjui","prompt":"Enter passphrase ...: "}
//! relay -> stub    {"type":"secret","secret":"<base64>"}
//!                  {"type":"cancelled"}
//! ```

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AskpassError, AskpassResult};

/// Upper bound for a single protocol line, newline included.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Identifier of one prompt request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Secret bytes entered by the user.
///
/// Zeroed on drop, never printed by `Debug`, base64 on the wire.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the secret bytes.
    ///
    /// Use immediately and let go; do not copy them into long-lived storage.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut encoded = base64::engine::general_purpose::STANDARD.encode(&self.0);
        let result = serializer.serialize_str(&encoded);
        encoded.zeroize();
        result
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut encoded = String::deserialize(deserializer)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom);
        encoded.zeroize();
        decoded.map(Self)
    }
}

/// Prompt request sent by a stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskpassRequest {
    /// Assigned by the relay when the stub leaves it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,

    /// Who is asking (shown next to the prompt).
    #[serde(default)]
    pub label: String,

    /// Prompt text exactly as the transport passed it.
    pub prompt: String,
}

impl AskpassRequest {
    pub fn new(label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Some(RequestId::new()),
            label: label.into(),
            prompt: prompt.into(),
        }
    }
}

/// Final result of one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The user submitted a secret.
    Answered(Secret),
    /// The prompt was dismissed, or the relay shut down before an answer.
    Cancelled,
}

impl PromptOutcome {
    pub fn from_secret(secret: Option<Secret>) -> Self {
        secret.map_or(Self::Cancelled, Self::Answered)
    }
}

/// Relay reply to a stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AskpassResponse {
    Secret { secret: Secret },
    Cancelled,
}

impl From<PromptOutcome> for AskpassResponse {
    fn from(outcome: PromptOutcome) -> Self {
        match outcome {
            PromptOutcome::Answered(secret) => Self::Secret { secret },
            PromptOutcome::Cancelled => Self::Cancelled,
        }
    }
}

impl From<AskpassResponse> for PromptOutcome {
    fn from(response: AskpassResponse) -> Self {
        match response {
            AskpassResponse::Secret { secret } => Self::Answered(secret),
            AskpassResponse::Cancelled => Self::Cancelled,
        }
    }
}

/// Read one message line.
///
/// Returns `Ok(None)` when the peer closed the stream before sending anything.
pub async fn read_message<R, T>(reader: &mut R) -> AskpassResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = Vec::new();
    let limit = MAX_MESSAGE_BYTES as u64;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\n") && read as u64 >= limit {
        line.zeroize();
        return Err(AskpassError::RequestTooLarge {
            limit: MAX_MESSAGE_BYTES,
        });
    }

    let parsed = serde_json::from_slice(&line)
        .map_err(|e| AskpassError::MalformedRequest(e.to_string()));
    line.zeroize();
    parsed.map(Some)
}

/// Write one message line and flush it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> AskpassResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    let result = writer.write_all(&json).await;
    json.zeroize();
    result?;
    writer.flush().await?;
    Ok(())
}
