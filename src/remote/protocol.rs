//! Wire format of the shape endpoint.
//!
//! # Request
//!
//! ```text
//! GET {base}/v1/shape?table=documents&offset=-1[&handle=..][&where=..][&columns=a,b]
//!                    [&live=true&cursor=..]
//! ```
//!
//! # Response
//!
//! Headers carry the stream position (`electric-handle`, `electric-offset`,
//! `electric-cursor`) and `electric-up-to-date` once caught up. The body is a
//! JSON array of change and control messages:
//!
//! ```text
//! [{"key": "..", "value": {"id": 1, ..}, "headers": {"operation": "insert"}},
//!  {"headers": {"control": "up-to-date"}}]
//! ```
//!
//! HTTP 409 means the shape must be refetched from scratch.

use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::shape::TransportError;

pub const SHAPE_PATH: &str = "v1/shape";
pub const HANDLE_HEADER: &str = "electric-handle";
pub const OFFSET_HEADER: &str = "electric-offset";
pub const CURSOR_HEADER: &str = "electric-cursor";
pub const UP_TO_DATE_HEADER: &str = "electric-up-to-date";

/// Offset requesting a fresh snapshot.
pub const INITIAL_OFFSET: &str = "-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    UpToDate,
    MustRefetch,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlHeaders {
    pub control: Control,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeHeaders {
    pub operation: Operation,
}

/// A row change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeMessage {
    pub key: String,
    #[serde(default)]
    pub value: Map<String, Value>,
    pub headers: ChangeHeaders,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Control { headers: ControlHeaders },
    Change(ChangeMessage),
}

/// Parameters of one shape request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest<'a> {
    pub table: &'a str,
    pub where_clause: Option<&'a str>,
    pub columns: Option<&'a [String]>,
    pub handle: Option<&'a str>,
    pub offset: &'a str,
    /// Long-poll for new changes; only valid once caught up.
    pub live: bool,
    pub cursor: Option<&'a str>,
}

impl ShapeRequest<'_> {
    pub fn url(&self, base: &Url) -> Result<Url, TransportError> {
        let mut url = join_base(base)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("table", self.table);
            query.append_pair("offset", self.offset);
            if let Some(handle) = self.handle {
                query.append_pair("handle", handle);
            }
            if let Some(filter) = self.where_clause {
                query.append_pair("where", filter);
            }
            if let Some(columns) = self.columns {
                query.append_pair("columns", &columns.join(","));
            }
            if self.live {
                query.append_pair("live", "true");
                if let Some(cursor) = self.cursor {
                    query.append_pair("cursor", cursor);
                }
            }
        }
        Ok(url)
    }
}

fn join_base(base: &Url) -> Result<Url, TransportError> {
    // Keep any path prefix on the base URL.
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(SHAPE_PATH)
        .map_err(|e| TransportError::Request(format!("invalid shape URL: {e}")))
}

/// A successful response, decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeResponse {
    pub handle: Option<String>,
    pub offset: Option<String>,
    pub cursor: Option<String>,
    pub up_to_date: bool,
    pub messages: Vec<Message>,
}

impl ShapeResponse {
    /// Whether the response declared the stream caught up, in a header or
    /// in-band.
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date || self.has_control(Control::UpToDate)
    }

    pub fn must_refetch(&self) -> bool {
        self.has_control(Control::MustRefetch)
    }

    fn has_control(&self, wanted: Control) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m, Message::Control { headers } if headers.control == wanted))
    }

    /// Row changes in arrival order.
    pub fn into_changes(self) -> Vec<ChangeMessage> {
        self.messages
            .into_iter()
            .filter_map(|m| match m {
                Message::Change(change) => Some(change),
                Message::Control { .. } => None,
            })
            .collect()
    }
}

/// Decode a response body. An empty body has no messages.
pub fn parse_messages(body: &str) -> Result<Vec<Message>, TransportError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))
}
