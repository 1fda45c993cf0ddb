pub mod closure;

use std::any;

use tracing::error;

use crate::container::{Container, ContainerError, Managed};
use crate::util::any::{Downcast, DowncastRef};

/// A type-erased constructor of the service registered under a key.
///
/// A [`Builder`] is invoked at most once per successful resolution of its
/// key. It receives the [`Container`] so that it can resolve other keys the
/// service depends on.
///
/// Usually, you don't need to implement [`Builder`] manually, since this is
/// automatically done by [`TypedBuilder`]'s blanket implementation, and
/// closures are accepted directly by [`Container::set`].
#[cfg_attr(test, mockall::automock)]
pub trait Builder: Send + Sync + 'static {
    /// Constructs the initial value of the service registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency can't be resolved or the
    /// construction itself fails.
    fn dyn_build(&self, container: &Container, key: &str)
        -> Result<Box<dyn Managed>, ContainerError>;
}

/// A static variant of the [`Builder`] trait.
pub trait TypedBuilder: Builder {
    /// The type of the value produced by this builder.
    type Output: Managed;

    /// Constructs the initial value of the service registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a dependency can't be resolved or the
    /// construction itself fails.
    fn build(&self, container: &Container, key: &str) -> Result<Self::Output, ContainerError>;
}

impl<T: TypedBuilder> Builder for T {
    fn dyn_build(
        &self,
        container: &Container,
        key: &str,
    ) -> Result<Box<dyn Managed>, ContainerError> {
        self.build(container, key)
            .map(|obj| -> Box<dyn Managed> { Box::new(obj) })
    }
}

/// A type-erased decorator applied to a freshly built service before it is
/// cached.
///
/// Extenders of a key run in registration order, each one receiving the value
/// produced by the previous step.
pub trait Extender: Send + Sync + 'static {
    /// Transforms `value`, which was produced for `key` by the builder or by
    /// the previous extender.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::TypeMismatch`] if `value` is not of the
    /// type this extender works on, or any error raised while extending.
    fn dyn_extend(
        &self,
        value: Box<dyn Managed>,
        container: &Container,
        key: &str,
    ) -> Result<Box<dyn Managed>, ContainerError>;
}

/// A static variant of the [`Extender`] trait. The type check of the incoming
/// value is done by the blanket [`Extender`] implementation.
pub trait TypedExtender: Extender {
    /// The type of the value accepted and returned by this extender.
    type Target: Managed;

    /// Transforms `value` of the service registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the extension fails.
    fn extend(
        &self,
        value: Self::Target,
        container: &Container,
        key: &str,
    ) -> Result<Self::Target, ContainerError>;
}

impl<T: TypedExtender> Extender for T {
    fn dyn_extend(
        &self,
        value: Box<dyn Managed>,
        container: &Container,
        key: &str,
    ) -> Result<Box<dyn Managed>, ContainerError> {
        match value.downcast::<T::Target>() {
            Ok(value) => self
                .extend(*value, container, key)
                .map(|obj| -> Box<dyn Managed> { Box::new(obj) }),
            Err(value) => {
                let err = ContainerError::TypeMismatch {
                    key: key.to_owned(),
                    expected: any::type_name::<T::Target>(),
                    found: value.target_type_name(),
                };
                error!("{}", err);
                Err(err)
            }
        }
    }
}
