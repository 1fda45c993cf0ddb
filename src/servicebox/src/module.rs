use crate::container::{Container, ContainerError};

/// A unit of wiring code which registers services into a [`Container`].
///
/// Closures of `Fn(&Container) -> Result<(), ContainerError>` are modules as
/// well.
pub trait Module: Send + Sync + 'static {
    /// Registers services into `container`.
    ///
    /// # Errors
    ///
    /// Returns the first registration error, e.g. when a key registered by
    /// the module already exists.
    fn configure(&self, container: &Container) -> Result<(), ContainerError>;
}

impl<F> Module for F
where
    F: Fn(&Container) -> Result<(), ContainerError> + Send + Sync + 'static,
{
    fn configure(&self, container: &Container) -> Result<(), ContainerError> {
        self(container)
    }
}

/// An ordered set of [`Module`]s, configured one after another.
#[derive(Default)]
pub struct Configuration {
    modules: Vec<Box<dyn Module>>,
}

impl Configuration {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with<M: Module>(mut self, module: M) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    pub fn compose(mut self, mut other: Configuration) -> Self {
        self.modules.append(&mut other.modules);
        self
    }
}

impl Module for Configuration {
    fn configure(&self, container: &Container) -> Result<(), ContainerError> {
        self.modules
            .iter()
            .try_for_each(|module| container.install(module.as_ref()))
    }
}
