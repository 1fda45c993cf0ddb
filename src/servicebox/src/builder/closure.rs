use std::error::Error;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::error;

use crate::builder::{TypedBuilder, TypedExtender};
use crate::container::{Container, ContainerError, Managed};

/// A [`Builder`] which constructs the service with a closure.
///
/// # Examples
///
/// ```rust
/// # use std::convert::Infallible;
/// # use servicebox::builder::closure::ClosureBuilder;
/// let builder = ClosureBuilder::new(|_| Ok::<_, Infallible>(String::from("service")));
/// ```
///
/// [`Builder`]: crate::builder::Builder
pub struct ClosureBuilder<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>>,
    F: Fn(&Container) -> Result<T, E> + Send + Sync + 'static,
{
    closure: F,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E, F> ClosureBuilder<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>>,
    F: Fn(&Container) -> Result<T, E> + Send + Sync + 'static,
{
    pub fn new(closure: F) -> Self {
        Self {
            closure,
            _marker: PhantomData,
        }
    }
}

impl<T, E, F> Debug for ClosureBuilder<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>>,
    F: Fn(&Container) -> Result<T, E> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ClosureBuilder<T, E, F>")
            .finish_non_exhaustive()
    }
}

impl<T, E, F> TypedBuilder for ClosureBuilder<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>> + 'static,
    F: Fn(&Container) -> Result<T, E> + Send + Sync + 'static,
{
    type Output = T;

    fn build(&self, container: &Container, key: &str) -> Result<Self::Output, ContainerError> {
        (self.closure)(container).map_err(|err| construction_error(key, err))
    }
}

/// An [`Extender`] which decorates the service with a closure.
///
/// [`Extender`]: crate::builder::Extender
pub struct ClosureExtender<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>>,
    F: Fn(T, &Container) -> Result<T, E> + Send + Sync + 'static,
{
    closure: F,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E, F> ClosureExtender<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>>,
    F: Fn(T, &Container) -> Result<T, E> + Send + Sync + 'static,
{
    pub fn new(closure: F) -> Self {
        Self {
            closure,
            _marker: PhantomData,
        }
    }
}

impl<T, E, F> Debug for ClosureExtender<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>>,
    F: Fn(T, &Container) -> Result<T, E> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ClosureExtender<T, E, F>")
            .finish_non_exhaustive()
    }
}

impl<T, E, F> TypedExtender for ClosureExtender<T, E, F>
where
    T: Managed,
    E: Into<Box<dyn Error + Send + Sync>> + 'static,
    F: Fn(T, &Container) -> Result<T, E> + Send + Sync + 'static,
{
    type Target = T;

    fn extend(
        &self,
        value: Self::Target,
        container: &Container,
        key: &str,
    ) -> Result<Self::Target, ContainerError> {
        (self.closure)(value, container).map_err(|err| construction_error(key, err))
    }
}

/// Errors of the container itself pass through untouched, so that a missing
/// dependency deep in a chain of builders is still reported as such.
fn construction_error<E>(key: &str, err: E) -> ContainerError
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    let err: Box<dyn Error + Send + Sync> = err.into();
    match err.downcast::<ContainerError>() {
        Ok(err) => *err,
        Err(source) => {
            let source: Arc<dyn Error + Send + Sync> = Arc::from(source);
            let err = ContainerError::Construction {
                key: key.to_owned(),
                source: Arc::clone(&source),
            };
            error!(%source, "{}", err);
            err
        }
    }
}
