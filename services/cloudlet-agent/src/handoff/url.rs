//! Handoff destination URLs.

use std::fmt;

use reqwest::Url;

use super::HandoffError;

/// Where a handoff sends the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffDestination {
    /// Capture a residue archive locally and upload it under this name.
    File(String),
    /// Stream directly to a receiving worker.
    Tcp { host: String, port: u16 },
    /// Negotiate a destination VM on a remote deployment first.
    Http(Url),
}

impl HandoffDestination {
    pub fn parse(raw: &str) -> Result<Self, HandoffError> {
        let invalid = |reason: &str| HandoffError::InvalidDestination(format!("{raw}: {reason}"));

        if let Some(name) = raw.strip_prefix("file://") {
            if name.is_empty() {
                return Err(invalid("missing residue name"));
            }
            return Ok(HandoffDestination::File(name.to_string()));
        }

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "tcp" => {
                let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(HandoffDestination::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "http" | "https" => {
                if url.host_str().is_none() {
                    return Err(invalid("missing host"));
                }
                Ok(HandoffDestination::Http(url))
            }
            scheme => Err(invalid(&format!("unsupported scheme {scheme}"))),
        }
    }
}

impl fmt::Display for HandoffDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffDestination::File(name) => write!(f, "file://{name}"),
            HandoffDestination::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            HandoffDestination::Http(url) => write!(f, "{url}"),
        }
    }
}

impl std::str::FromStr for HandoffDestination {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
