use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Request, rejection::BytesRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use pimon_proto::{MetricSample, SampleError};

/// Schema-checked `MetricSample` extractor.
///
/// Requires a JSON content type, a body with every sample field present and
/// numeric, and values that pass [`MetricSample::validate`].
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct ValidSample(pub MetricSample);

impl<S> FromRequest<S> for ValidSample
where
    S: Send + Sync,
{
    type Rejection = SampleRejection;

    async fn from_request(req: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        if !json_content_type(req.headers()) {
            return Err(SampleRejection::MissingJsonContentType);
        }

        let bytes = Bytes::from_request(req, state).await?;

        Self::from_bytes(&bytes)
    }
}

impl ValidSample {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SampleRejection> {
        let sample: MetricSample = serde_json::from_slice(bytes)?;
        sample.validate()?;
        Ok(ValidSample(sample))
    }
}

fn json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|content_type| content_type.to_str().ok())
        .and_then(|content_type| content_type.parse::<mime::Mime>().ok())
        .is_some_and(|mime| {
            mime.type_() == mime::APPLICATION
                && (mime.subtype() == mime::JSON
                    || mime.suffix().is_some_and(|name| name == mime::JSON))
        })
}

#[derive(thiserror::Error, Debug)]
pub enum SampleRejection {
    #[error("Failed to parse the sample: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid sample: {0}")]
    Invalid(#[from] SampleError),
    #[error("Expected request with `Content-Type: application/json`")]
    MissingJsonContentType,
    #[error(transparent)]
    BytesRejection(#[from] BytesRejection),
}

impl IntoResponse for SampleRejection {
    fn into_response(self) -> Response {
        use SampleRejection::*;
        match self {
            MissingJsonContentType => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, self.to_string()).into_response()
            }
            Json(_) | Invalid(_) => (StatusCode::BAD_REQUEST, self.to_string()).into_response(),
            BytesRejection(rejection) => rejection.into_response(),
        }
    }
}
