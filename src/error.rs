use reqwest::StatusCode;
use thiserror::Error;

/// Failure talking to the completion provider or to Chatwoot.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{service} rate limited the request ({status})")]
    RateLimited {
        service: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{service} request timed out")]
    Timeout { service: &'static str },

    #[error("{service} API error ({status})")]
    Status {
        service: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse {service} response: {source}")]
    InvalidResponse {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("completion provider returned no reply text")]
    EmptyCompletion,
}

impl UpstreamError {
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { service }
        } else if err.is_decode() {
            Self::InvalidResponse {
                service,
                source: err,
            }
        } else {
            Self::Transport {
                service,
                source: err,
            }
        }
    }

    /// Build an error from a non-success response, consuming its body.
    pub async fn from_response(service: &'static str, response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited {
                service,
                status,
                body,
            }
        } else {
            Self::Status {
                service,
                status,
                body,
            }
        }
    }

    /// Rate limits and client-side timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout { .. })
    }

    /// Status code and body of the failed response, if one was received.
    pub fn response_detail(&self) -> Option<(StatusCode, &str)> {
        match self {
            Self::RateLimited { status, body, .. } | Self::Status { status, body, .. } => {
                Some((*status, body.as_str()))
            }
            _ => None,
        }
    }
}
