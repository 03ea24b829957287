use std::fmt;

use tokio_tungstenite::tungstenite::http::Uri;

use crate::transport::ConnectError;

/// Normalised dispatcher address.
///
/// Accepts `ws://` and `wss://` URLs as-is, rewrites the historical
/// `tcp://host:port` form to `ws://host:port`, and treats a bare
/// `host:port` as `ws://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ConnectError> {
        let raw = raw.trim();
        let url = if let Some(rest) = raw.strip_prefix("tcp://") {
            format!("ws://{rest}")
        } else if raw.starts_with("ws://") || raw.starts_with("wss://") {
            raw.to_string()
        } else if raw.contains("://") {
            return Err(ConnectError::AddressInvalid(format!(
                "unsupported scheme in '{raw}'"
            )));
        } else {
            format!("ws://{raw}")
        };

        let uri: Uri = url
            .parse()
            .map_err(|e| ConnectError::AddressInvalid(format!("'{raw}': {e}")))?;
        if uri.host().map_or(true, str::is_empty) {
            return Err(ConnectError::AddressInvalid(format!(
                "'{raw}' does not name a host"
            )));
        }

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn tcp_scheme_is_rewritten() {
        let endpoint = Endpoint::parse("tcp://lighthouse.example.org:5570").unwrap();
        assert_eq!(endpoint.as_str(), "ws://lighthouse.example.org:5570");
    }

    #[test]
    fn bare_host_port_gets_ws_scheme() {
        let endpoint = Endpoint::parse(" 10.0.0.5:5570 ").unwrap();
        assert_eq!(endpoint.as_str(), "ws://10.0.0.5:5570");
    }

    #[test]
    fn websocket_urls_pass_through() {
        assert_eq!(
            Endpoint::parse("wss://lh.example.org/spark").unwrap().as_str(),
            "wss://lh.example.org/spark"
        );
        assert_eq!(
            Endpoint::parse("ws://127.0.0.1:9000").unwrap().to_string(),
            "ws://127.0.0.1:9000"
        );
    }

    #[test]
    fn unsupported_scheme_is_invalid() {
        assert_matches!(
            Endpoint::parse("http://lh:80"),
            Err(ConnectError::AddressInvalid(_))
        );
    }

    #[test]
    fn garbage_is_invalid() {
        assert_matches!(
            Endpoint::parse("not a host"),
            Err(ConnectError::AddressInvalid(_))
        );
        assert_matches!(Endpoint::parse(""), Err(ConnectError::AddressInvalid(_)));
    }
}
