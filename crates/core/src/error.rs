use std::path::PathBuf;

/// Fatal errors raised while loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The configuration in '{path}' is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("The configuration defines no Lighthouse server to connect to")]
    MissingServer,

    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Fatal errors raised while resolving the machine identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read {what} from '{path}': {source}")]
    Read {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The {what} read from '{path}' is empty")]
    Empty { what: &'static str, path: PathBuf },
}

/// Errors decoding or encoding a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
