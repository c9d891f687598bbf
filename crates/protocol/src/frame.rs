use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::FrameType;

/// Envelope for all frames on a session's wire.
///
/// Every field except `type` is optional and omitted from the JSON when
/// unset. `args` and `data` use `serde_json::value::RawValue` to defer
/// payload deserialization, so a frame held in the missed-frame buffer
/// replays byte for byte what was originally sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Request correlation id: set by the client on `call` frames and
    /// echoed by the server on the matching `response`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
    /// Human-readable failure message; a `response` carrying this instead
    /// of `data` rejects the call without tearing the connection down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub need_reload: Option<bool>,
    /// Server-assigned per-session sequence number, present on every
    /// `response` and `push`. On `control` frames it does not consume a
    /// number: a connect carries the client's last processed sequence, a
    /// `clientConnect` the session's current watermark, an ack the highest
    /// sequence the client has processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Frame {
    fn bare(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            req_id: None,
            method: None,
            args: None,
            data: None,
            error: None,
            channel: None,
            client_id: None,
            need_reload: None,
            seq: None,
        }
    }

    /// Creates a method invocation frame.
    pub fn call<T: Serialize + ?Sized>(
        req_id: u64,
        method: impl Into<String>,
        args: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let mut frame = Self::bare(FrameType::Call);
        frame.req_id = Some(req_id);
        frame.method = Some(method.into());
        frame.args = to_raw(args)?;
        Ok(frame)
    }

    /// Creates a successful response to the call with the given id.
    pub fn response<T: Serialize + ?Sized>(
        req_id: u64,
        data: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let mut frame = Self::bare(FrameType::Response);
        frame.req_id = Some(req_id);
        frame.data = to_raw(data)?;
        Ok(frame)
    }

    /// Creates an error-flagged response to the call with the given id.
    pub fn error_response(req_id: u64, message: impl Into<String>) -> Self {
        let mut frame = Self::bare(FrameType::Response);
        frame.req_id = Some(req_id);
        frame.error = Some(message.into());
        frame
    }

    /// Creates a push frame, optionally scoped to a channel.
    pub fn push<T: Serialize + ?Sized>(
        channel: Option<&str>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut frame = Self::bare(FrameType::Push);
        frame.channel = channel.map(str::to_owned);
        frame.data = to_raw(Some(data))?;
        Ok(frame)
    }

    /// Client half of the session handshake, the first frame on every new
    /// socket. `client_id` is the id from a previous connection (absent to
    /// request a fresh session); `last_seq` is the highest sequence number
    /// the client has fully processed, omitted on the wire while zero.
    pub fn connect(client_id: Option<&str>, last_seq: u64) -> Self {
        let mut frame = Self::bare(FrameType::Control);
        frame.client_id = client_id.map(str::to_owned);
        frame.seq = (last_seq > 0).then_some(last_seq);
        frame
    }

    /// Server half of the handshake (`clientConnect`). `baseline` is the
    /// session's current sequence watermark: when `need_reload` is set the
    /// client repositions itself there, discarding anything older.
    pub fn client_connect(client_id: impl Into<String>, need_reload: bool, baseline: u64) -> Self {
        let mut frame = Self::bare(FrameType::Control);
        frame.client_id = Some(client_id.into());
        frame.need_reload = Some(need_reload);
        frame.seq = Some(baseline);
        frame
    }

    /// Acknowledges every sequenced frame up to and including `seq`.
    pub fn ack(seq: u64) -> Self {
        let mut frame = Self::bare(FrameType::Control);
        frame.seq = Some(seq);
        frame
    }

    /// Deserializes the call arguments into the given type.
    pub fn parse_args<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.args {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Deserializes the response or push payload into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}

fn to_raw<T: Serialize + ?Sized>(
    value: Option<&T>,
) -> Result<Option<Box<RawValue>>, serde_json::Error> {
    match value {
        Some(v) => {
            let json = serde_json::to_string(v)?;
            Ok(Some(RawValue::from_string(json)?))
        }
        None => Ok(None),
    }
}

/// Application payload carried by push frames: an event name plus its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
