//! Minimal ArangoDB document client for the sender pool.
//!
//! Speaks the plain HTTP document API: one `insert` per event, with the
//! backend's idempotency contract surfaced as typed errors. Each sender
//! worker owns its own client; nothing here is shared between workers.

use serde::Deserialize;

use crate::config::DatabaseConfig;

/// `ERR_ARANGO_UNIQUE_CONSTRAINT_VIOLATED`: a document with the same
/// `_key` already exists. The relay treats this as delivered.
pub const ERROR_DUPLICATE_KEY: i64 = 1210;

/// `ERR_HTTP_CORRUPTED_JSON`: the backend could not decode the document
/// body (non-finite numbers in the current wire format).
pub const ERROR_SERIALIZATION_REJECTED: i64 = 600;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArangoError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("arango error {error_num}: {message}")]
    Api { error_num: i64, message: String },
}

impl ArangoError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, ArangoError::Api { error_num, .. } if *error_num == ERROR_DUPLICATE_KEY)
    }

    pub fn is_serialization_rejected(&self) -> bool {
        matches!(
            self,
            ArangoError::Api { error_num, .. } if *error_num == ERROR_SERIALIZATION_REJECTED
        )
    }
}

/// Error body returned by the document API on failed inserts.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "errorNum")]
    error_num: i64,
    #[serde(rename = "errorMessage")]
    error_message: String,
}

// ---------------------------------------------------------------------------
// ArangoClient
// ---------------------------------------------------------------------------

/// One connection to the central document database.
pub struct ArangoClient {
    http: reqwest::Client,
    /// `{url}/_db/{name}/_api/document`; collection name appended per insert.
    document_endpoint: String,
}

impl ArangoClient {
    pub fn new(cfg: &DatabaseConfig) -> Result<Self, ArangoError> {
        let http = reqwest::Client::builder().build()?;
        let document_endpoint = format!(
            "{}/_db/{}/_api/document",
            cfg.url.trim_end_matches('/'),
            cfg.name
        );
        Ok(ArangoClient {
            http,
            document_endpoint,
        })
    }

    /// Insert `document` into `collection`.
    ///
    /// `silent=true`: the backend returns no document metadata on success.
    /// Failed inserts come back as [`ArangoError::Api`] carrying the
    /// backend's `errorNum`, which the caller inspects for the duplicate
    /// and serialization cases.
    pub async fn insert(
        &self,
        collection: &str,
        document: &serde_json::Value,
    ) -> Result<(), ArangoError> {
        let url = format!("{}/{}?silent=true", self.document_endpoint, collection);
        let response = self.http.post(&url).json(document).send().await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(api) => Err(ArangoError::Api {
                error_num: api.error_num,
                message: api.error_message,
            }),
            Err(_) => Err(ArangoError::Api {
                error_num: 0,
                message: format!("HTTP {}: {}", status, body),
            }),
        }
    }
}
