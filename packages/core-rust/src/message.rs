//! Message context carried through mediation, plus the response and fault
//! descriptors the correlation engine works with.
//!
//! The envelope body is kept as an opaque `serde_json::Value`: encoding and
//! decoding the wire format belongs to the transport, not to this crate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::continuation::ContinuationStack;
use crate::fault::FaultStack;
use crate::guard::ResponseGuard;

/// Property used to thread the correlation id through protocols without
/// WS-Addressing (POX/REST). Transports echo it back on the reply.
pub const CORRELATION_PROPERTY: &str = "conduit.correlation_id";

/// Numeric error codes recorded in [`FaultInfo::code`].
pub mod error_codes {
    /// Generic failure sending the outbound request.
    pub const SENDING_FAILURE: i32 = 101_500;
    /// Failed to read the backend response.
    pub const RECEIVE_FAILURE: i32 = 101_501;
    /// Connection to the backend could not be established.
    pub const CONNECTION_FAILED: i32 = 101_503;
    /// The pending call expired before any response arrived.
    pub const CALLBACK_TIMEOUT: i32 = 101_504;
    /// The backend closed the connection mid-exchange.
    pub const CONNECTION_CLOSED: i32 = 101_505;
    /// The backend spoke a protocol we could not follow.
    pub const PROTOCOL_VIOLATION: i32 = 101_506;
    /// Connect attempt timed out at the transport level.
    pub const CONNECT_TIMEOUT: i32 = 101_508;
    /// An error raised while mediating the response itself.
    pub const MEDIATION_FAILURE: i32 = 0;
}

// ---------------------------------------------------------------------------
// Protocol / envelope
// ---------------------------------------------------------------------------

/// Message protocol, which decides correlation style and fault shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    Soap11,
    Soap12,
    /// Plain XML over HTTP.
    Pox,
    Rest,
}

impl ProtocolVersion {
    /// SOAP messages correlate through WS-Addressing `RelatesTo`; everything
    /// else relies on [`CORRELATION_PROPERTY`].
    #[must_use]
    pub fn uses_addressing(self) -> bool {
        matches!(self, Self::Soap11 | Self::Soap12)
    }

    /// Envelope namespace for SOAP versions.
    #[must_use]
    pub fn namespace(self) -> Option<&'static str> {
        match self {
            Self::Soap11 => Some("http://schemas.xmlsoap.org/soap/envelope/"),
            Self::Soap12 => Some("http://www.w3.org/2003/05/soap-envelope"),
            Self::Pox | Self::Rest => None,
        }
    }
}

/// Protocol-tagged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: ProtocolVersion,
    pub body: serde_json::Value,
    /// `true` when the body is a fault rather than a regular payload.
    pub fault: bool,
}

impl Envelope {
    #[must_use]
    pub fn new(version: ProtocolVersion, body: serde_json::Value) -> Self {
        Self {
            version,
            body,
            fault: false,
        }
    }

    /// An empty fault envelope for `version`: a bare `Fault` element for
    /// SOAP, an empty body for POX/REST.
    #[must_use]
    pub fn empty_fault(version: ProtocolVersion) -> Self {
        let body = if version.uses_addressing() {
            serde_json::json!({ "Fault": {} })
        } else {
            serde_json::Value::Null
        };
        Self {
            version,
            body,
            fault: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Fault descriptors
// ---------------------------------------------------------------------------

/// Broad class of a failure routed through the fault stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The call expired in the registry.
    Timeout,
    /// The outbound leg failed before any backend reply.
    SendingFault,
    /// Mediating the response raised an error.
    Mediation,
}

/// Error detail attached to a message before a fault handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInfo {
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
    pub detail: Option<String>,
}

impl FaultInfo {
    /// Expiry of a pending call whose deadline was `deadline_ms`.
    #[must_use]
    pub fn timeout(deadline_ms: u64) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            code: error_codes::CALLBACK_TIMEOUT,
            message: "Send timeout".to_string(),
            detail: Some(format!("no response before deadline {deadline_ms}")),
        }
    }

    /// Failure reported by the transport for the outbound leg.
    pub fn sending(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::SendingFault,
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Error raised while processing a response.
    #[must_use]
    pub fn mediation(err: &anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Mediation,
            code: error_codes::MEDIATION_FAILURE,
            message: err.to_string(),
            detail: Some(format!("{err:#}")),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Call-level timeouts, whether detected by the sweeper or reported by
    /// the transport with the callback-timeout code.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout || self.code == error_codes::CALLBACK_TIMEOUT
    }
}

// ---------------------------------------------------------------------------
// Correlation id
// ---------------------------------------------------------------------------

/// Key linking an outbound dispatch to its eventual response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The correlation id of an outbound message is its own message id, so
    /// the reply's `RelatesTo` (or echoed correlation property) maps back.
    #[must_use]
    pub fn for_outbound(msg: &MessageContext) -> Self {
        Self(msg.message_id.clone())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Inbound response
// ---------------------------------------------------------------------------

/// What the transport delivered for an outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// A genuine backend reply (which may itself be a business fault).
    Reply(Envelope),
    /// The outbound leg failed, e.g. connection refused.
    SendingFault(FaultInfo),
    /// Provisional acknowledgement such as HTTP 202 with no body.
    Accepted,
}

/// Raw response handed to the engine by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResponse {
    pub relates_to: Option<String>,
    pub kind: ResponseKind,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl InboundResponse {
    #[must_use]
    pub fn reply(envelope: Envelope) -> Self {
        Self {
            relates_to: None,
            kind: ResponseKind::Reply(envelope),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn sending_fault(info: FaultInfo) -> Self {
        Self {
            relates_to: None,
            kind: ResponseKind::SendingFault(info),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn accepted() -> Self {
        Self {
            relates_to: None,
            kind: ResponseKind::Accepted,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn relating_to(mut self, id: impl Into<String>) -> Self {
        self.relates_to = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Resolves the correlation id: `RelatesTo` first, then the echoed
    /// [`CORRELATION_PROPERTY`].
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        if let Some(id) = &self.relates_to {
            return Some(CorrelationId::new(id.clone()));
        }
        self.properties
            .get(CORRELATION_PROPERTY)
            .and_then(serde_json::Value::as_str)
            .map(CorrelationId::from)
    }
}

// ---------------------------------------------------------------------------
// MessageContext
// ---------------------------------------------------------------------------

/// One message in flight through mediation.
///
/// Owns its fault and continuation stacks. The engine hands a message to at
/// most one thread at a time, so none of this is synchronized; only the
/// response guard is shared with the originating inbound request.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: String,
    pub relates_to: Option<String>,
    /// Tracing id propagated across every message of one flow.
    pub trace_id: String,
    pub is_response: bool,
    /// Target endpoint address for outbound messages.
    pub to: Option<String>,
    pub envelope: Envelope,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub fault_stack: FaultStack,
    pub continuation: ContinuationStack,
    /// Error detail of the failure currently being handled, if any.
    pub fault: Option<FaultInfo>,
    /// Member of a failover/load-balance group that most recently accepted
    /// this message.
    pub successful_endpoint: Option<String>,
    pub response_guard: Option<Arc<ResponseGuard>>,
}

fn new_message_id() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

impl MessageContext {
    /// Creates a fresh message with a new message id and trace id.
    #[must_use]
    pub fn new(envelope: Envelope) -> Self {
        Self {
            message_id: new_message_id(),
            relates_to: None,
            trace_id: Uuid::new_v4().to_string(),
            is_response: false,
            to: None,
            envelope,
            properties: BTreeMap::new(),
            fault_stack: FaultStack::new(),
            continuation: ContinuationStack::new(),
            fault: None,
            successful_endpoint: None,
            response_guard: None,
        }
    }

    /// Creates an inbound request message with its own response guard.
    #[must_use]
    pub fn inbound_request(envelope: Envelope) -> Self {
        let mut msg = Self::new(envelope);
        msg.response_guard = Some(Arc::new(ResponseGuard::new(msg.message_id.clone())));
        msg
    }

    #[must_use]
    pub fn with_to(mut self, address: impl Into<String>) -> Self {
        self.to = Some(address.into());
        self
    }

    #[must_use]
    pub fn protocol(&self) -> ProtocolVersion {
        self.envelope.version
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.properties.insert(key.into(), value);
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// Rebuilds an inbound-shaped message from a backend reply.
    ///
    /// The new message gets its own message id and relates to `self`; trace
    /// id, properties, both stacks and the response guard carry over so
    /// mediation resumes with the original flow's state. Properties sent back
    /// by the transport are layered on top.
    #[must_use]
    pub fn response_from(
        &self,
        envelope: Envelope,
        transport_properties: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut properties = self.properties.clone();
        properties.extend(transport_properties);
        Self {
            message_id: new_message_id(),
            relates_to: Some(self.message_id.clone()),
            trace_id: self.trace_id.clone(),
            is_response: true,
            to: None,
            envelope,
            properties,
            fault_stack: self.fault_stack.clone(),
            continuation: self.continuation.clone(),
            fault: None,
            successful_endpoint: self.successful_endpoint.clone(),
            response_guard: self.response_guard.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
