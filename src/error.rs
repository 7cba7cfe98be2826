use hickory_proto::ProtoError;
use hickory_proto::op::ResponseCode;
use thiserror::Error;

/// Failure of a single query. Never crosses into another query's task.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("malformed query: {0}")]
    Format(&'static str),
    #[error("upstream request to {upstream} failed: {source}")]
    Transport {
        upstream: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream {upstream} answered HTTP {status}")]
    UpstreamStatus {
        upstream: String,
        status: reqwest::StatusCode,
    },
    #[error("question cannot be encoded into an upstream URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to read upstream body: {0}")]
    Body(#[source] reqwest::Error),
    #[error("upstream body is not a JSON DNS answer: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to serialise DNS reply: {0}")]
    Serialize(#[from] ProtoError),
}

impl QueryError {
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::Format(_) => ResponseCode::FormErr,
            _ => ResponseCode::ServFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_map_to_formerr_and_the_rest_to_servfail() {
        assert_eq!(
            QueryError::Format("two questions").response_code(),
            ResponseCode::FormErr
        );
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(
            QueryError::from(json).response_code(),
            ResponseCode::ServFail
        );
    }
}
