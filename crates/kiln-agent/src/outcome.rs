use crate::error::SupervisorError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;

/// `{success, data?, error?}` value handed to the UI for direct display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            hint: None,
        }
    }

    pub fn failed(err: &SupervisorError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES)),
            code: Some(err.code().to_string()),
            hint: err.hint().map(str::to_string),
        }
    }
}

impl<T> From<Result<T, SupervisorError>> for Outcome<T> {
    fn from(value: Result<T, SupervisorError>) -> Self {
        match value {
            Ok(v) => Self::ok(v),
            Err(e) => Self::failed(&e),
        }
    }
}
