//! Wire protocol spoken by hosts and clients
//!
//! Every frame is a MessagePack map carrying a caller-chosen correlation `id`
//! and exactly one payload variant. The broker only inspects the fields that
//! govern routing and lifecycle; widget blobs stay opaque `Bytes`.
//!
//! Responses always echo the `id` of the frame that caused them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ErrorReport, Result};

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation ID chosen by the sender
    pub id: String,
    pub payload: Payload,
}

/// Closed set of message kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    InitializeHost(InitializeHost),
    InitializeHostCompleted(InitializeHostCompleted),
    InitializeClient(InitializeClient),
    InitializeClientCompleted(InitializeClientCompleted),
    RenderWidget(RenderWidget),
    RerunPage(RerunPage),
    CloseSession(CloseSession),
    ScriptFinished(ScriptFinished),
    Exception(Exception),
}

/// Sent by a host right after connecting: who it is and which pages it serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeHost {
    /// Plaintext API key the host authenticates with
    pub api_key: String,
    pub sdk_name: String,
    pub sdk_version: String,
    #[serde(default)]
    pub pages: Vec<PageDeclaration>,
}

/// A page as declared by a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDeclaration {
    pub id: String,
    pub name: String,
    pub route: String,
    /// Navigation ordering vector
    #[serde(default)]
    pub path: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeHostCompleted {
    pub host_instance_id: String,
}

/// Sent by a client to attach to a page; relayed to the chosen host with
/// `session_id` and `user_id` filled in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeClient {
    pub page_id: String,
    /// Needed only when the page ID is declared under several API keys
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeClientCompleted {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderWidget {
    pub session_id: String,
    pub widget: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunPage {
    pub session_id: String,
    pub page_id: String,
    #[serde(default)]
    pub state: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSession {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFinished {
    pub session_id: String,
    #[serde(default)]
    pub result: Bytes,
}

/// Error frame. `status_code` follows HTTP status classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(default)]
    pub session_id: Option<String>,
    pub title: String,
    pub message: String,
    pub status_code: u16,
    #[serde(default)]
    pub stack: Option<String>,
}

impl Frame {
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Exception frame answering the frame with correlation `id`
    pub fn exception(
        id: impl Into<String>,
        session_id: Option<String>,
        report: &ErrorReport,
        expose_stacks: bool,
    ) -> Self {
        Self::new(
            id,
            Payload::Exception(Exception {
                session_id,
                title: report.title.to_string(),
                message: report.detail.clone(),
                status_code: report.status.as_u16(),
                stack: report.exposed_stack(expose_stacks),
            }),
        )
    }

    /// Message kind, for logs
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Payload::InitializeHost(_) => "initialize_host",
            Payload::InitializeHostCompleted(_) => "initialize_host_completed",
            Payload::InitializeClient(_) => "initialize_client",
            Payload::InitializeClientCompleted(_) => "initialize_client_completed",
            Payload::RenderWidget(_) => "render_widget",
            Payload::RerunPage(_) => "rerun_page",
            Payload::CloseSession(_) => "close_session",
            Payload::ScriptFinished(_) => "script_finished",
            Payload::Exception(_) => "exception",
        }
    }

    /// Session the frame is addressed to, if any
    pub fn session_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::InitializeClient(m) => m.session_id.as_deref(),
            Payload::InitializeClientCompleted(m) => Some(&m.session_id),
            Payload::RenderWidget(m) => Some(&m.session_id),
            Payload::RerunPage(m) => Some(&m.session_id),
            Payload::CloseSession(m) => Some(&m.session_id),
            Payload::ScriptFinished(m) => Some(&m.session_id),
            Payload::Exception(m) => m.session_id.as_deref(),
            Payload::InitializeHost(_) | Payload::InitializeHostCompleted(_) => None,
        }
    }

    /// Serialize to MessagePack bytes
    pub fn encode(&self) -> Result<Bytes> {
        Ok(rmp_serde::to_vec_named(self)?.into())
    }

    /// Deserialize from MessagePack bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PorticoError;

    #[test]
    fn test_widget_blob_survives_encoding() {
        let frame = Frame::new(
            "req-1",
            Payload::RenderWidget(RenderWidget {
                session_id: "s-1".into(),
                widget: Bytes::from_static(&[0, 159, 146, 150, 255]),
            }),
        );

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.session_id(), Some("s-1"));
        assert_eq!(decoded.kind(), "render_widget");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        #[derive(Serialize)]
        struct Bare<'a> {
            page_id: &'a str,
        }
        #[derive(Serialize)]
        struct Wire<'a> {
            id: &'a str,
            payload: std::collections::BTreeMap<&'a str, Bare<'a>>,
        }

        let mut payload = std::collections::BTreeMap::new();
        payload.insert("initialize_client", Bare { page_id: "p-1" });
        let bytes = rmp_serde::to_vec_named(&Wire { id: "x", payload }).unwrap();

        let frame = Frame::decode(&bytes).unwrap();
        match frame.payload {
            Payload::InitializeClient(init) => {
                assert_eq!(init.page_id, "p-1");
                assert!(init.session_id.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_invalid_argument() {
        let err = Frame::decode(&[0xc1, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, PorticoError::InvalidArgument(_)));
    }

    #[test]
    fn test_exception_echoes_correlation_id() {
        let report = ErrorReport::new(&PorticoError::NotFound("Session s-9".into()));
        let frame = Frame::exception("req-7", Some("s-9".into()), &report, true);

        assert_eq!(frame.id, "req-7");
        match frame.payload {
            Payload::Exception(e) => {
                assert_eq!(e.status_code, 404);
                assert_eq!(e.title, "Not found");
                assert_eq!(e.message, "Session s-9");
                assert!(e.stack.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
