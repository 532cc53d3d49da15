//! Error types for Keppel
//!
//! One internal kind per failure mode in the core engines, mapped at
//! the (external) HTTP edge onto the OCI distribution error codes.

use thiserror::Error;

/// Result type for Keppel operations
pub type Result<T> = std::result::Result<T, Error>;

/// OCI registry v2 error code, per the distribution spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    ManifestUnverified,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    TagInvalid,
    Unauthorized,
    Denied,
    Unsupported,
}

impl Code {
    /// Canonical OCI error code string, e.g. `"BLOB_UNKNOWN"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Code::BlobUnknown => "BLOB_UNKNOWN",
            Code::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            Code::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            Code::DigestInvalid => "DIGEST_INVALID",
            Code::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            Code::ManifestInvalid => "MANIFEST_INVALID",
            Code::ManifestUnknown => "MANIFEST_UNKNOWN",
            Code::ManifestUnverified => "MANIFEST_UNVERIFIED",
            Code::NameInvalid => "NAME_INVALID",
            Code::NameUnknown => "NAME_UNKNOWN",
            Code::SizeInvalid => "SIZE_INVALID",
            Code::TagInvalid => "TAG_INVALID",
            Code::Unauthorized => "UNAUTHORIZED",
            Code::Denied => "DENIED",
            Code::Unsupported => "UNSUPPORTED",
        }
    }

    /// Canonical HTTP status for this code.
    pub fn http_status(self) -> u16 {
        match self {
            Code::BlobUnknown
            | Code::ManifestUnknown
            | Code::NameUnknown
            | Code::BlobUploadUnknown => 404,
            Code::DigestInvalid
            | Code::ManifestInvalid
            | Code::NameInvalid
            | Code::SizeInvalid
            | Code::TagInvalid
            | Code::BlobUploadInvalid
            | Code::ManifestBlobUnknown
            | Code::ManifestUnverified => 422,
            Code::Unauthorized => 401,
            Code::Denied => 403,
            Code::Unsupported => 501,
        }
    }
}

/// Keppel error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("manifest blob unknown: {0}")]
    ManifestBlobUnknown(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("manifest unverified: {0}")]
    ManifestUnverified(String),

    #[error("name invalid: {0}")]
    NameInvalid(String),

    #[error("name unknown: {0}")]
    NameUnknown(String),

    #[error("digest invalid: {0}")]
    DigestInvalid(String),

    #[error("size invalid: {0}")]
    SizeInvalid(String),

    #[error("tag invalid: {0}")]
    TagInvalid(String),

    #[error("upload unknown: {0}")]
    UploadUnknown(String),

    #[error("upload invalid: {0}")]
    UploadInvalid(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("policy invalid: {0}")]
    PolicyInvalid(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Map this error onto its OCI wire error code.
    pub fn code(&self) -> Code {
        match self {
            Error::BlobUnknown(_) | Error::UploadUnknown(_) => Code::BlobUnknown,
            Error::ManifestUnknown(_) => Code::ManifestUnknown,
            Error::ManifestBlobUnknown(_) => Code::ManifestBlobUnknown,
            Error::ManifestInvalid(_) => Code::ManifestInvalid,
            Error::ManifestUnverified(_) => Code::ManifestUnverified,
            Error::NameInvalid(_) => Code::NameInvalid,
            Error::NameUnknown(_) => Code::NameUnknown,
            Error::DigestInvalid(_) => Code::DigestInvalid,
            Error::SizeInvalid(_) => Code::SizeInvalid,
            Error::TagInvalid(_) => Code::TagInvalid,
            Error::UploadInvalid(_) => Code::BlobUploadInvalid,
            Error::Unauthorized(_) => Code::Unauthorized,
            Error::Denied(_) | Error::PolicyInvalid(_) => Code::Denied,
            Error::Unsupported(_) => Code::Unsupported,
            // Transient/internal failures aren't representable as a single
            // OCI code; callers at the edge fall back to 500/502/503.
            Error::Storage(_)
            | Error::Upstream(_)
            | Error::Internal(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Database(_) => Code::Unsupported,
        }
    }
}

/// Structured error body per the OCI distribution spec:
/// `{"errors":[{"code":..., "message":..., "detail":...}]}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Error {
    /// Build the OCI wire error body for this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            errors: vec![ErrorEntry {
                code: self.code().as_str().to_string(),
                message: self.to_string(),
                detail: None,
            }],
        }
    }
}
