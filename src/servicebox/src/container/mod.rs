mod core;
mod entry;
mod handle;

use std::error::Error;
use std::sync::Arc;

use snafu::prelude::*;

use crate::util::any::AsAny;

pub use entry::EntryStatus;
pub use handle::Container;

/// A value which can be stored in a [`Container`].
///
/// Every `Send + Sync + 'static` type is [`Managed`]. The concrete type of a
/// stored value is kept alongside it and checked on every typed retrieval.
pub trait Managed: AsAny + Send + Sync + 'static {}

impl<T> Managed for T where T: AsAny + Send + Sync + 'static {}

#[derive(Debug, Clone, Snafu)]
#[non_exhaustive]
pub enum ContainerError {
    #[snafu(display("service keys must not be empty"))]
    EmptyKey,
    #[snafu(display("the key {key} already exists in the container"))]
    #[non_exhaustive]
    DuplicateKey { key: String },
    #[snafu(display("could not find any service registered under the key {key}"))]
    #[non_exhaustive]
    UnknownKey { key: String },
    #[snafu(display("could not extend the service {key} which is already resolved"))]
    #[non_exhaustive]
    AlreadyResolved { key: String },
    #[snafu(display("the service {key} is a {found}, but a {expected} is expected"))]
    #[non_exhaustive]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[snafu(display("could not construct the service {key} which depends on itself somehow"))]
    #[non_exhaustive]
    CyclicDependency { key: String },
    #[snafu(display("could not construct the service {key}"))]
    #[non_exhaustive]
    Construction {
        key: String,
        source: Arc<dyn Error + Send + Sync>,
    },
}

impl ContainerError {
    /// Returns the key the error is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::EmptyKey => None,
            Self::DuplicateKey { key }
            | Self::UnknownKey { key }
            | Self::AlreadyResolved { key }
            | Self::TypeMismatch { key, .. }
            | Self::CyclicDependency { key }
            | Self::Construction { key, .. } => Some(key),
        }
    }
}
