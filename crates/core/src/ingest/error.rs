use std::fmt;

/// Upstream fetch failure (unreachable host or non-2xx status).
///
/// Attached to the `anyhow::Error` returned by fetchers so callers can
/// `downcast_ref` it for logging.
#[derive(Debug, Clone)]
pub struct FetchError {
    pub origin: &'static str,
    pub stage: &'static str,
    pub url: String,
    pub status: Option<u16>,
    pub detail: String,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetch error (origin={}, stage={}, url={}",
            self.origin, self.stage, self.url
        )?;
        if let Some(status) = self.status {
            write!(f, ", status={status}")?;
        }
        write!(f, "): {}", self.detail)
    }
}

impl std::error::Error for FetchError {}
