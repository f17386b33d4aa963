//! Response classification: one upstream response in, one [`Outcome`] out.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::source::SourceResponse;

/// Field carrying the processing status in upstream error bodies.
const STATUS_FIELD: &str = "StatusProcessamento";

/// Processing status reported by the upstream in a structured error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamStatus {
    /// `NENHUM_DOCUMENTO_LOCALIZADO`
    NoDocumentFound,
    /// `REJEICAO` / `REJEIÇÃO`
    Rejection,
    Unknown(String),
}

impl UpstreamStatus {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_uppercase();
        match normalized.as_str() {
            "NENHUM_DOCUMENTO_LOCALIZADO" => UpstreamStatus::NoDocumentFound,
            "REJEICAO" | "REJEIÇÃO" => UpstreamStatus::Rejection,
            _ => UpstreamStatus::Unknown(normalized),
        }
    }
}

/// Classification of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 204: nothing left upstream.
    Done,
    /// Structured "no document found for this tenant".
    NoDocument,
    /// Structured rejection, with the first error code when present.
    Rejected { code: Option<String> },
    /// 429, with the upstream's `Retry-After` hint when it sent one.
    RateLimited { retry_after: Option<Duration> },
    /// Network failure, 5xx or another unexpected status.
    TransientError { reason: String },
    /// Valid JSON response; the body is searched for documents.
    Confirmed { body: Value },
    /// Wrong content type, unparseable JSON or unrecognised status.
    Malformed { reason: String },
}

/// Fieldless view of [`Outcome`] for counters and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Done,
    NoDocument,
    Rejected,
    RateLimited,
    TransientError,
    Confirmed,
    Malformed,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Done => "DONE",
            OutcomeKind::NoDocument => "NO_DOCUMENT",
            OutcomeKind::Rejected => "REJECTED",
            OutcomeKind::RateLimited => "RATE_LIMITED",
            OutcomeKind::TransientError => "TRANSIENT_ERROR",
            OutcomeKind::Confirmed => "CONFIRMED",
            OutcomeKind::Malformed => "MALFORMED",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Done => OutcomeKind::Done,
            Outcome::NoDocument => OutcomeKind::NoDocument,
            Outcome::Rejected { .. } => OutcomeKind::Rejected,
            Outcome::RateLimited { .. } => OutcomeKind::RateLimited,
            Outcome::TransientError { .. } => OutcomeKind::TransientError,
            Outcome::Confirmed { .. } => OutcomeKind::Confirmed,
            Outcome::Malformed { .. } => OutcomeKind::Malformed,
        }
    }

    /// Whether this outcome ends the round. `Done` only does when
    /// `stop_on_done` is set.
    pub fn stops_round(&self, stop_on_done: bool) -> bool {
        match self {
            Outcome::Done => stop_on_done,
            Outcome::NoDocument | Outcome::Rejected { .. } | Outcome::RateLimited { .. } => true,
            Outcome::TransientError { .. } | Outcome::Confirmed { .. } | Outcome::Malformed { .. } => {
                false
            }
        }
    }

    /// Stops that may not be trusted to mean "end of data". Without a
    /// confirmed outcome in the same round they leave the cursor alone.
    pub fn is_unconfirmed_stop(&self) -> bool {
        matches!(
            self,
            Outcome::NoDocument | Outcome::Rejected { .. } | Outcome::RateLimited { .. }
        )
    }
}

/// Map a status code, content type and body onto an [`Outcome`].
pub fn classify(status: u16, content_type: Option<&str>, body: &str) -> Outcome {
    match status {
        204 => return Outcome::Done,
        429 => return Outcome::RateLimited { retry_after: None },
        200..=299 | 400..=499 => {}
        _ => {
            return Outcome::TransientError {
                reason: format!("HTTP {status}"),
            }
        }
    }

    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    if !content_type.contains("application/json") {
        return Outcome::Malformed {
            reason: format!(
                "HTTP {status} with non-JSON content type '{content_type}': {}",
                snippet(body)
            ),
        };
    }

    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            return Outcome::Malformed {
                reason: format!("HTTP {status} with invalid JSON: {e}"),
            }
        }
    };

    if status < 400 {
        return Outcome::Confirmed { body: parsed };
    }

    let Some(raw_status) = parsed.get(STATUS_FIELD).and_then(Value::as_str) else {
        return Outcome::Malformed {
            reason: format!("HTTP {status} without {STATUS_FIELD}: {}", snippet(body)),
        };
    };
    match UpstreamStatus::parse(raw_status) {
        UpstreamStatus::NoDocumentFound => Outcome::NoDocument,
        UpstreamStatus::Rejection => Outcome::Rejected {
            code: first_error_code(&parsed),
        },
        UpstreamStatus::Unknown(other) => Outcome::Malformed {
            reason: format!("HTTP {status} with unrecognised {STATUS_FIELD} '{other}'"),
        },
    }
}

/// Classify a full response, carrying the `Retry-After` hint into
/// [`Outcome::RateLimited`].
pub fn classify_response(response: &SourceResponse) -> Outcome {
    match classify(
        response.status,
        response.content_type.as_deref(),
        &response.body,
    ) {
        Outcome::RateLimited { .. } => Outcome::RateLimited {
            retry_after: response.retry_after,
        },
        other => other,
    }
}

/// `Erros[0].Codigo`, e.g. `E2214`.
fn first_error_code(body: &Value) -> Option<String> {
    let code = body.get("Erros")?.as_array()?.first()?.get("Codigo")?;
    match code {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn snippet(body: &str) -> String {
    body.trim().chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JSON: Option<&str> = Some("application/json; charset=utf-8");

    #[test]
    fn test_no_content_is_done() {
        assert_eq!(classify(204, None, ""), Outcome::Done);
    }

    #[test]
    fn test_no_document_found() {
        let body = json!({ "StatusProcessamento": "NENHUM_DOCUMENTO_LOCALIZADO" }).to_string();
        assert_eq!(classify(404, JSON, &body), Outcome::NoDocument);
    }

    #[test]
    fn test_rejection_with_code() {
        let body = json!({
            "StatusProcessamento": "Rejeição",
            "Erros": [{ "Codigo": "E2214", "Descricao": "NSU maior que o permitido" }]
        })
        .to_string();
        assert_eq!(
            classify(400, JSON, &body),
            Outcome::Rejected {
                code: Some("E2214".to_string())
            }
        );

        let bare = json!({ "StatusProcessamento": "REJEICAO" }).to_string();
        assert_eq!(classify(400, JSON, &bare), Outcome::Rejected { code: None });
    }

    #[test]
    fn test_unknown_status_is_malformed_not_terminal() {
        let body = json!({ "StatusProcessamento": "MANUTENCAO" }).to_string();
        let outcome = classify(400, JSON, &body);
        assert_eq!(outcome.kind(), OutcomeKind::Malformed);
        assert!(!outcome.stops_round(true));

        let no_status = json!({ "message": "bad request" }).to_string();
        assert_eq!(classify(404, JSON, &no_status).kind(), OutcomeKind::Malformed);
    }

    #[test]
    fn test_rate_limited_carries_hint() {
        let response = SourceResponse {
            status: 429,
            content_type: None,
            retry_after: Some(Duration::from_secs(7)),
            body: String::new(),
        };
        assert_eq!(
            classify_response(&response),
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn test_server_errors_are_transient() {
        for status in [500, 502, 503, 504, 302, 101] {
            assert_eq!(
                classify(status, JSON, "{}").kind(),
                OutcomeKind::TransientError,
                "{status}"
            );
        }
    }

    #[test]
    fn test_confirmed_and_malformed_success() {
        let body = json!({ "LoteDFe": [] }).to_string();
        assert_eq!(
            classify(200, JSON, &body),
            Outcome::Confirmed {
                body: json!({ "LoteDFe": [] })
            }
        );
        assert_eq!(
            classify(200, Some("text/html"), "<html/>").kind(),
            OutcomeKind::Malformed
        );
        assert_eq!(classify(200, JSON, "{oops").kind(), OutcomeKind::Malformed);
        assert_eq!(classify(404, Some("text/plain"), "nope").kind(), OutcomeKind::Malformed);
    }

    #[test]
    fn test_stop_policy() {
        assert!(Outcome::Done.stops_round(true));
        assert!(!Outcome::Done.stops_round(false));
        assert!(!Outcome::Done.is_unconfirmed_stop());
        assert!(Outcome::NoDocument.is_unconfirmed_stop());
        assert!(Outcome::RateLimited { retry_after: None }.stops_round(false));
        assert!(!Outcome::TransientError {
            reason: "x".to_string()
        }
        .stops_round(true));
    }
}
