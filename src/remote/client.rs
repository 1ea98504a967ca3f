//! HTTP client for the shape endpoint.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::trace;
use url::Url;

use super::protocol::{
    parse_messages, ShapeRequest, ShapeResponse, CURSOR_HEADER, HANDLE_HEADER, OFFSET_HEADER,
    UP_TO_DATE_HEADER,
};
use crate::shape::TransportError;

/// Result of one shape request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Batch(ShapeResponse),
    /// The server discarded the shape; start over, with the new handle if given.
    MustRefetch { handle: Option<String> },
}

#[derive(Clone)]
pub struct ShapeClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ShapeClient {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn fetch(&self, request: &ShapeRequest<'_>) -> Result<FetchOutcome, TransportError> {
        let url = request.url(&self.base_url)?;
        trace!(url = %url, "shape request");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();

        if status == StatusCode::CONFLICT {
            return Ok(FetchOutcome::MustRefetch {
                handle: header(&headers, HANDLE_HEADER),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if status.is_server_error() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(FetchOutcome::Batch(ShapeResponse {
            handle: header(&headers, HANDLE_HEADER),
            offset: header(&headers, OFFSET_HEADER),
            cursor: header(&headers, CURSOR_HEADER),
            up_to_date: headers.contains_key(UP_TO_DATE_HEADER),
            messages: parse_messages(&body)?,
        }))
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}
