//! REST API types.
//!
//! Preview results are returned as JSON. Conversions return the CSV body
//! directly, with the run summary in response headers.

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ConvertError, ServerError};
use crate::models::{FlatRow, RunState};
use crate::parser::Preview;

/// Response header carrying the job id.
pub const HEADER_JOB_ID: &str = "x-job-id";
/// Response header carrying the terminal run state.
pub const HEADER_RUN_STATUS: &str = "x-run-status";
/// Response header carrying the number of rows written.
pub const HEADER_RECORD_COUNT: &str = "x-record-count";

/// File name suggested for converted output.
pub const OUTPUT_FILE_NAME: &str = "converted_data.csv";

/// Response sent after previewing a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResponse {
    /// Job identifier. Posting it alone to `/api/convert` converts the
    /// previewed document without fetching it again.
    pub job_id: String,

    /// Status: "ready" or "empty"
    pub status: String,

    /// Inferred record tag
    pub record_tag: Option<String>,

    /// Flattened columns of the sample record
    pub columns: Vec<String>,

    /// Sample record values
    pub row: Option<FlatRow>,

    /// Sample record as XML
    pub xml_sample: Option<String>,

    /// The sample ended before a record was found
    pub truncated: bool,
}

impl PreviewResponse {
    pub fn new(job_id: String, preview: Preview) -> Self {
        Self {
            job_id,
            status: if preview.record_tag.is_some() { "ready" } else { "empty" }.to_string(),
            record_tag: preview.record_tag,
            columns: preview.columns,
            row: preview.row,
            xml_sample: preview.xml_sample,
            truncated: preview.truncated,
        }
    }
}

/// Response for a stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub job_id: String,
    pub stopping: bool,
}

/// Create an error response
pub fn error_response(error: &str) -> Value {
    json!({
        "status": RunState::Failed,
        "error": error,
    })
}

impl ServerError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::JobNotFound(_) => StatusCode::NOT_FOUND,
            Self::Convert(ConvertError::Fetch(_)) => StatusCode::BAD_GATEWAY,
            Self::Convert(ConvertError::Parse(_)) | Self::Convert(ConvertError::Config(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Convert(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Status code and JSON body, as returned by handlers.
    pub fn into_response_parts(self) -> (StatusCode, Json<Value>) {
        (self.status_code(), Json(error_response(&self.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;

    #[test]
    fn test_preview_response_status() {
        let preview = Preview {
            record_tag: Some("Item".into()),
            columns: vec!["Item_A".into()],
            row: None,
            xml_sample: None,
            truncated: false,
        };
        let response = PreviewResponse::new("job".into(), preview);
        assert_eq!(response.status, "ready");

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["recordTag"], "Item");
        assert_eq!(json["columns"][0], "Item_A");
    }

    #[test]
    fn test_error_status_codes() {
        let fetch = ServerError::Convert(ConvertError::Fetch(FetchError::Status {
            url: "http://example.test".into(),
            status: 500,
        }));
        assert_eq!(fetch.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ServerError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);

        let (status, Json(body)) = ServerError::JobNotFound("abc".into()).into_response_parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "failed");
        assert!(body["error"].as_str().unwrap().contains("abc"));
    }
}
