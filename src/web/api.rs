//! The HTTP API, all under /api. Endpoints return JSON.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, Method, Request, Response, StatusCode};

use crate::{
    auth::TokenAuth,
    service::Service,
    storage::ReviewFormat,
    web::{
        interface::{ErrorResponse, ListResponse, SubmitRequest, SubmitResponse},
        util::{json, json_ok},
    },
};

const DEFAULT_LIST_LIMIT: usize = 50;

pub async fn call(
    service: Arc<Service>,
    auth: Arc<TokenAuth>,
    request: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let api = ApiService { service, auth };

    match (request.method(), request.uri().path()) {
        (&Method::POST, "/api/review") => api.handle_submit(request).await,
        (&Method::GET, "/api/review") => api.handle_get_review(&request),
        (&Method::GET, "/api/reviews") => api.handle_list(&request),
        (&Method::GET, "/api/status") => api.handle_status(),
        (_method, path) => json(
            ErrorResponse::new(format!("Route not found: {path}")),
            StatusCode::NOT_FOUND,
        ),
    }
}

struct ApiService {
    service: Arc<Service>,
    auth: Arc<TokenAuth>,
}

impl ApiService {
    async fn handle_submit(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let body = match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return json(
                    ErrorResponse::new(format!("Failed to read request body: {e}")),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let submission: SubmitRequest = match serde_json::from_slice(&body) {
            Ok(submission) => submission,
            Err(e) => {
                return json(
                    ErrorResponse::new(format!("Invalid request body: {e}")),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let Some(token) = submission.token.as_deref().filter(|t| self.auth.is_valid(t))
        else {
            return json(
                ErrorResponse::new("Invalid token"),
                StatusCode::UNAUTHORIZED,
            );
        };

        match self.service.submit(&submission, token) {
            Ok(review_id) => json_ok(SubmitResponse { review_id }),
            Err(e) if e.is_input_error() => {
                json(ErrorResponse::new(e.to_string()), StatusCode::BAD_REQUEST)
            }
            Err(e) => {
                log::error!("Submit failed: {e}");
                json(
                    ErrorResponse::new("Internal server error"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        }
    }

    fn handle_get_review(&self, request: &Request<Incoming>) -> Response<Full<Bytes>> {
        let params = query_params(request.uri());

        let Some(review_id) = params.get("id") else {
            return json(
                ErrorResponse::new("Missing review id"),
                StatusCode::BAD_REQUEST,
            );
        };

        let token = params.get("token").map(String::as_str).unwrap_or("");
        if !token.is_empty() && !self.auth.is_valid(token) {
            return json(
                ErrorResponse::new("Invalid token"),
                StatusCode::UNAUTHORIZED,
            );
        }

        let format = params
            .get("format")
            .and_then(|format| format.parse::<ReviewFormat>().ok());
        let superuser = self.auth.is_superuser(token);

        match self.service.get_review(review_id, token, format, superuser) {
            Ok(Some(details)) => json_ok(details),
            Ok(None) => json(
                ErrorResponse::new("Review not found or access denied"),
                StatusCode::NOT_FOUND,
            ),
            Err(e) => {
                log::error!("Failed to fetch review {review_id}: {e}");
                json(
                    ErrorResponse::new("Internal server error"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        }
    }

    fn handle_list(&self, request: &Request<Incoming>) -> Response<Full<Bytes>> {
        let params = query_params(request.uri());

        let token = params.get("token").map(String::as_str).unwrap_or("");
        if !self.auth.is_valid(token) {
            return json(
                ErrorResponse::new("Invalid or missing token"),
                StatusCode::UNAUTHORIZED,
            );
        }

        let limit = params
            .get("limit")
            .and_then(|limit| limit.parse().ok())
            .unwrap_or(DEFAULT_LIST_LIMIT);

        let superuser_requested = params.get("superuser").map(String::as_str) == Some("true");
        if superuser_requested && !self.auth.is_superuser(token) {
            return json(
                ErrorResponse::new("Superuser access denied"),
                StatusCode::FORBIDDEN,
            );
        }

        // `public_only` is accepted for UI compatibility; records carry no
        // visibility flag, so it does not filter anything.

        match self.service.list_reviews(token, limit, superuser_requested) {
            Ok(reviews) => json_ok(ListResponse { reviews }),
            Err(e) => {
                log::error!("Failed to list reviews: {e}");
                json(
                    ErrorResponse::new("Internal server error"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        }
    }

    fn handle_status(&self) -> Response<Full<Bytes>> {
        match self.service.status() {
            Ok(status) => json_ok(status),
            Err(e) => {
                log::error!("Failed to compute status: {e}");
                json(
                    ErrorResponse::new("Internal server error"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        }
    }
}

fn query_params(uri: &hyper::Uri) -> HashMap<String, String> {
    let Some(query) = uri.query() else {
        return HashMap::new();
    };

    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

/// Minimal percent-decoding: tokens, UUIDs, and format names are ASCII, so
/// only `%XX` escapes and `+` need handling.
fn percent_decode(input: &str) -> String {
    let mut output = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();

    while let Some(byte) = bytes.next() {
        match byte {
            b'%' => {
                let high = bytes.next().and_then(hex_value);
                let low = bytes.next().and_then(hex_value);
                match (high, low) {
                    (Some(high), Some(low)) => output.push(high << 4 | low),
                    _ => output.push(b'%'),
                }
            }
            b'+' => output.push(b' '),
            other => output.push(other),
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
