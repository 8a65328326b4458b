//! VM group orchestration and cluster lifecycle engine.
//!
//! Compiles declarative VM group requests into fully resolved orchestration
//! plans and drives cluster create/update/delete against a [`VmProvider`],
//! including root load balancer setup, security rule reconciliation, and
//! recovery of in-flight work after a controller switchover.
//!
//! [`VmProvider`]: ec_infra::VmProvider

pub mod cache;
pub mod cloudinit;
pub mod cluster;
pub mod compiler;
pub mod config;
pub mod dns;
pub mod gpu;
pub mod ha;
pub mod image;
pub mod interfaces;
pub mod model;
pub mod names;
pub mod netscheme;
pub mod platform;
pub mod progress;
pub mod readiness;
pub mod rootlb;
pub mod security;
pub mod spec;
pub mod ssh;

#[cfg(test)]
mod testutil;

pub use platform::VmPlatform;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request itself is wrong. Retrying without changing it cannot help.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A named resource (flavor, network, image) could not be resolved.
    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error(transparent)]
    Infra(#[from] ec_infra::Error),

    /// Infrastructure did not converge before the deadline.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("remote command failed: {0}")]
    Ssh(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Process wiring is broken (missing bootstrap client, cache inconsistency).
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{phase}: {source}")]
    Phase {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the name of the lifecycle phase it came from.
    pub fn phase(phase: &'static str, err: impl Into<Error>) -> Self {
        Self::Phase {
            phase,
            source: Box::new(err.into()),
        }
    }

    /// The innermost error, with any phase wrapping peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the same request could succeed later without being changed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Config(_) | Self::Lookup(_) | Self::Fatal(_) | Self::Checksum { .. } => false,
            Self::Infra(e) => !matches!(
                e,
                ec_infra::Error::InvalidPlan(_)
                    | ec_infra::Error::MissingEnv(_)
                    | ec_infra::Error::UnknownProvider(_)
            ),
            _ => true,
        }
    }

    /// Whether the provider reported the server as gone.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::Infra(e) => e.is_server_not_found(),
            other => other.to_string().contains(ec_infra::SERVER_DOES_NOT_EXIST),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
