use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("cannot parse {what}: {value:?}")]
    Parse { what: &'static str, value: String },

    #[error("invalid wireguard key for {0}")]
    InvalidKey(String),

    #[error("address {0} is already claimed")]
    AddressCollision(String),

    #[error("reconcile deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    pub fn parse(what: &'static str, value: impl Into<String>) -> Self {
        Error::Parse {
            what,
            value: value.into(),
        }
    }
}
