use std::path::PathBuf;

/// Fatal configuration errors: malformed CLI/rc-file input, missing
/// mandatory options, or an rc-file that can't be read at all.
///
/// All of these are handled identically by `main` — print to stderr, exit 1
/// — but keeping them typed lets callers (and tests) match on the cause
/// instead of string-matching an `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{path} line {line}: syntax error")]
    RcFileSyntax { path: PathBuf, line: usize },

    #[error("{path}: {source}")]
    RcFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid `{option}` value `{value}`: {reason}")]
    InvalidValue {
        option: &'static str,
        value: String,
        reason: String,
    },

    #[error("missing mandatory option: at least one of `extstack` or `baseaddr` is required")]
    MissingStackConfig,

    #[error("invalid proxy rule `{0}`: expected `extport,intaddr,intport`")]
    InvalidProxyRule(String),

    #[error("port must be non-zero in proxy rule `{0}`")]
    ZeroPort(String),

    #[error("failed to resolve internal address `{host}`: {source}")]
    UnresolvableHost {
        host: String,
        #[source]
        source: std::io::Error,
    },
}
