use std::any;
use std::convert::Infallible;
use std::error::Error;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::builder::closure::{ClosureBuilder, ClosureExtender};
use crate::builder::{Builder, Extender};
use crate::container::core::ContainerCore;
use crate::container::{ContainerError, EntryStatus, Managed};
use crate::module::Module;
use crate::util::any::{Downcast, DowncastRef};

/// A registry of lazily constructed services keyed by strings.
///
/// A key is registered either with a builder, which runs on the first
/// retrieval of the key, or with a ready value. Builders can be decorated by
/// extenders until the key is resolved. Resolved values are cached for the
/// lifetime of the container, so every retrieval of a key yields the same
/// instance.
///
/// [`Container`] is a cheap handle: clones share the same registry and can be
/// sent to other threads.
///
/// # Examples
///
/// ```rust
/// # use servicebox::container::Container;
/// #[derive(Default)]
/// struct Greeter {
///     greeting: String,
/// }
///
/// let container = Container::new();
/// container.set_value("greeting", String::from("Hello")).unwrap();
/// container.set("greeter", |_| Greeter::default()).unwrap();
/// container
///     .extend("greeter", |mut greeter: Greeter, container| {
///         greeter.greeting = container.get::<String>("greeting").unwrap().to_string();
///         greeter
///     })
///     .unwrap();
///
/// let greeter = container.get::<Greeter>("greeter").unwrap();
/// assert_eq!(greeter.greeting, "Hello");
/// ```
#[derive(Clone)]
pub struct Container {
    core: Arc<ContainerCore>,
}

impl Container {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ContainerCore::new()),
        }
    }

    /// Registers a builder under `key`. The builder isn't called until the key
    /// is retrieved for the first time.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::DuplicateKey`] if `key` is already registered
    /// and [`ContainerError::EmptyKey`] if `key` is empty.
    pub fn set<T, F>(&self, key: &str, builder: F) -> Result<(), ContainerError>
    where
        T: Managed,
        F: Fn(&Container) -> T + Send + Sync + 'static,
    {
        self.try_set(key, move |container| Ok::<_, Infallible>(builder(container)))
    }

    /// Registers a fallible builder under `key`. An error returned by the
    /// builder fails the retrieval which triggered it, and the builder is
    /// called again on the next retrieval.
    ///
    /// # Errors
    ///
    /// Same as [`Container::set`].
    pub fn try_set<T, E, F>(&self, key: &str, builder: F) -> Result<(), ContainerError>
    where
        T: Managed,
        E: Into<Box<dyn Error + Send + Sync>> + 'static,
        F: Fn(&Container) -> Result<T, E> + Send + Sync + 'static,
    {
        self.set_builder(key, ClosureBuilder::new(builder))
    }

    /// Registers a [`Builder`] implementation under `key`.
    ///
    /// # Errors
    ///
    /// Same as [`Container::set`].
    pub fn set_builder<B: Builder>(&self, key: &str, builder: B) -> Result<(), ContainerError> {
        self.core
            .insert_builder(key, Arc::new(builder))
            .inspect_err(|err| warn!("{}", err))
    }

    /// Registers an already constructed value under `key`. The key is
    /// resolved immediately and can't be extended.
    ///
    /// # Errors
    ///
    /// Same as [`Container::set`].
    pub fn set_value<T: Managed>(&self, key: &str, value: T) -> Result<(), ContainerError> {
        self.core
            .insert_value(key, Arc::new(value))
            .inspect_err(|err| warn!("{}", err))
    }

    /// Decorates the builder registered under `key`. Extenders run in the
    /// order they are registered, right after the builder.
    ///
    /// The type `T` is checked when the key is resolved: if the value flowing
    /// into the extender is not a `T`, the resolution fails with
    /// [`ContainerError::TypeMismatch`].
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::UnknownKey`] if `key` isn't registered and
    /// [`ContainerError::AlreadyResolved`] if it is resolved already, static
    /// values included.
    pub fn extend<T, F>(&self, key: &str, extender: F) -> Result<(), ContainerError>
    where
        T: Managed,
        F: Fn(T, &Container) -> T + Send + Sync + 'static,
    {
        self.try_extend(key, move |value, container| {
            Ok::<_, Infallible>(extender(value, container))
        })
    }

    /// Decorates the builder registered under `key` with a fallible extender.
    ///
    /// # Errors
    ///
    /// Same as [`Container::extend`].
    pub fn try_extend<T, E, F>(&self, key: &str, extender: F) -> Result<(), ContainerError>
    where
        T: Managed,
        E: Into<Box<dyn Error + Send + Sync>> + 'static,
        F: Fn(T, &Container) -> Result<T, E> + Send + Sync + 'static,
    {
        self.extend_with(key, ClosureExtender::new(extender))
    }

    /// Decorates the builder registered under `key` with an [`Extender`]
    /// implementation.
    ///
    /// # Errors
    ///
    /// Same as [`Container::extend`].
    pub fn extend_with<X: Extender>(&self, key: &str, extender: X) -> Result<(), ContainerError> {
        self.core
            .push_extender(key, Arc::new(extender))
            .inspect_err(|err| warn!("{}", err))
    }

    /// Retrieves the value registered under `key` without checking its type.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::UnknownKey`] if `key` isn't registered, or
    /// any error raised while running the builder and the extenders.
    pub fn dyn_get(&self, key: &str) -> Result<Arc<dyn Managed>, ContainerError> {
        self.core.resolve(self, key)
    }

    /// Retrieves the value registered under `key` as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::TypeMismatch`] if the value is not a `T`, and
    /// the errors of [`Container::dyn_get`].
    pub fn get<T: Managed>(&self, key: &str) -> Result<Arc<T>, ContainerError> {
        self.dyn_get(key)?
            .downcast::<T>()
            .map_err(|value| type_mismatch::<T>(key, &value))
    }

    /// Retrieves the value registered under `key` into `slot`. The slot is
    /// left untouched if the retrieval fails.
    ///
    /// # Errors
    ///
    /// Same as [`Container::get`].
    pub fn fill<T: Managed>(
        &self,
        key: &str,
        slot: &mut Option<Arc<T>>,
    ) -> Result<(), ContainerError> {
        let value = self.get::<T>(key)?;
        *slot = Some(value);
        Ok(())
    }

    /// Returns true if `key` is registered, no matter whether it is resolved.
    pub fn has(&self, key: &str) -> bool {
        self.core.contains(key)
    }

    /// Returns all registered keys in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.core.keys()
    }

    pub fn status(&self, key: &str) -> Option<EntryStatus> {
        self.core.status(key)
    }

    pub fn is_resolved(&self, key: &str) -> bool {
        self.status(key).is_some_and(EntryStatus::is_resolved)
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the registrations of `module` against this container.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the module.
    pub fn install<M>(&self, module: &M) -> Result<(), ContainerError>
    where
        M: Module + ?Sized,
    {
        debug!(module = any::type_name::<M>(), "installing module");
        module.configure(self)
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Container {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Container")
            .field("entries", &self.core)
            .finish()
    }
}

fn type_mismatch<T: Managed>(key: &str, value: &Arc<dyn Managed>) -> ContainerError {
    let err = ContainerError::TypeMismatch {
        key: key.to_owned(),
        expected: any::type_name::<T>(),
        found: value.target_type_name(),
    };
    error!("{}", err);
    err
}

#[cfg(test)]
mod tests {
    use std::thread;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct TestService {
        name: String,
        hits: Mutex<u32>,
    }

    impl TestService {
        fn hit(&self) -> u32 {
            let mut hits = self.hits.lock();
            *hits += 1;
            *hits
        }
    }

    #[test]
    fn container_operations_succeeds() {
        let container = Container::new();
        assert!(container.is_empty());
        assert!(container.keys().is_empty());

        container
            .set_value("name", String::from("test-service"))
            .unwrap();
        container
            .set("svc", |container| TestService {
                name: container.get::<String>("name").unwrap().to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(container.keys(), ["name", "svc"]);
        assert!(!container.is_resolved("svc"));

        let service = container.get::<TestService>("svc").unwrap();
        assert_eq!(service.name, "test-service");
        assert_eq!(service.hit(), 1);
        assert!(container.is_resolved("svc"));

        thread::spawn({
            let container = container.clone();
            move || {
                let service = container.get::<TestService>("svc").unwrap();
                assert_eq!(service.hit(), 2);
            }
        })
        .join()
        .expect("the thread should not `panic!()`");

        assert_eq!(*service.hits.lock(), 2);
    }

    #[test]
    fn container_get_fails_when_type_differs() {
        let container = Container::new();
        container.set_value("cfg", 42i32).unwrap();

        match container.get::<String>("cfg") {
            Err(ContainerError::TypeMismatch {
                key,
                expected,
                found,
            }) => {
                assert_eq!(key, "cfg");
                assert_eq!(expected, any::type_name::<String>());
                assert_eq!(found, "i32");
            }
            res => panic!("unexpected result {res:?}"),
        }
        assert_eq!(*container.get::<i32>("cfg").unwrap(), 42);
    }

    #[test]
    fn container_fill_leaves_slot_untouched_when_it_fails() {
        let container = Container::new();
        container.set("svc", |_| TestService::default()).unwrap();

        let mut service = None;
        container.fill::<TestService>("svc", &mut service).unwrap();
        assert!(service.is_some());

        let mut name = Some(Arc::new(String::from("untouched")));
        assert!(matches!(
            container.fill("svc", &mut name),
            Err(ContainerError::TypeMismatch { .. })
        ));
        assert!(matches!(
            container.fill("missing", &mut name),
            Err(ContainerError::UnknownKey { .. })
        ));
        assert_eq!(name.as_deref().map(String::as_str), Some("untouched"));
    }

    #[test]
    fn container_debug_lists_entry_states() {
        let container = Container::new();
        container.set_value("cfg", 42i32).unwrap();
        container.set("svc", |_| TestService::default()).unwrap();
        container
            .extend("svc", |service: TestService, _| service)
            .unwrap();

        let output = format!("{container:?}");
        assert!(output.contains(r#""cfg": Static"#));
        assert!(output.contains(r#""svc": Pending { extenders: 1 }"#));
    }
}
