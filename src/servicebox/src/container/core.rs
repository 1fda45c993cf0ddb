use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use oneshot::{Receiver, Sender};
use parking_lot::{RwLock, RwLockWriteGuard};
use snafu::prelude::*;
use tracing::{debug, debug_span, error, trace};

use crate::builder::{Builder, Extender};
use crate::container::entry::{Entry, EntryMap, EntryStatus};
use crate::container::{Container, ContainerError, EmptyKeySnafu, Managed};

pub struct ContainerCore {
    state: RwLock<RegistryState>,
}

impl ContainerCore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::new()),
        }
    }

    pub fn insert_builder(
        &self,
        key: &str,
        builder: Arc<dyn Builder>,
    ) -> Result<(), ContainerError> {
        self.insert(key, Entry::new_pending(builder))
    }

    pub fn insert_value(&self, key: &str, value: Arc<dyn Managed>) -> Result<(), ContainerError> {
        self.insert(key, Entry::new_static(value))
    }

    fn insert(&self, key: &str, entry: Entry) -> Result<(), ContainerError> {
        ensure!(!key.is_empty(), EmptyKeySnafu);
        trace!(key, ?entry, "registering");
        self.state.write().entries.insert(key, entry)
    }

    pub fn push_extender(
        &self,
        key: &str,
        extender: Arc<dyn Extender>,
    ) -> Result<(), ContainerError> {
        let mut state = self.state.write();
        if state.constructing.contains_key(key) {
            // The running construction took its snapshot of the extenders
            // already, so a late one would never be applied.
            return Err(ContainerError::AlreadyResolved {
                key: key.to_owned(),
            });
        }
        state.entries.push_extender(key, extender)?;
        trace!(key, "extender registered");
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().entries.contains(key)
    }

    pub fn status(&self, key: &str) -> Option<EntryStatus> {
        let state = self.state.read();
        if state.constructing.contains_key(key) {
            Some(EntryStatus::Constructing)
        } else {
            state.entries.get(key).map(Entry::status)
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.read().entries.keys().map(str::to_owned).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns the value of `key`, running its builder and extenders if the
    /// key is not resolved yet.
    ///
    /// The builder chain of a key runs at most once even if many threads ask
    /// for the key at the same time: the first one constructs the value while
    /// the others wait for its outcome.
    pub fn resolve(
        &self,
        container: &Container,
        key: &str,
    ) -> Result<Arc<dyn Managed>, ContainerError> {
        let span = debug_span!("resolve", key);
        let _guard = span.enter();

        if let Some(value) = self.try_get_resolved(key)? {
            debug!("found in cache");
            return Ok(value);
        }
        debug!("not found in cache");

        loop {
            let state = self.state.write();
            let pipeline = match state.entries.get(key) {
                Some(Entry::Pending { builder, extenders }) => {
                    Pipeline::new(Arc::clone(builder), extenders.clone())
                }
                // Another thread finished the construction between the two
                // lock acquisitions.
                Some(Entry::Resolved { value, .. }) => return Ok(Arc::clone(value)),
                None => return Err(self.unknown_key(key)),
            };

            let constructing = state
                .constructing
                .get(key)
                .map(ConstructingObjectContext::is_constructed_by_current_thread);
            match constructing {
                Some(true) => {
                    let err = ContainerError::CyclicDependency {
                        key: key.to_owned(),
                    };
                    error!("{}", err);
                    return Err(err);
                }
                Some(false) => {
                    let receiver = self.register_waiter(state, key);
                    match self.wait_for_constructed_object(receiver) {
                        Some(res) => return res,
                        // The constructing thread unwound before reporting
                        // anything, so the key is up for grabs again.
                        None => continue,
                    }
                }
                None => return self.construct(state, container, key, pipeline),
            }
        }
    }

    fn try_get_resolved(&self, key: &str) -> Result<Option<Arc<dyn Managed>>, ContainerError> {
        match self.state.read().entries.get(key) {
            Some(Entry::Resolved { value, .. }) => Ok(Some(Arc::clone(value))),
            Some(Entry::Pending { .. }) => Ok(None),
            None => Err(self.unknown_key(key)),
        }
    }

    fn unknown_key(&self, key: &str) -> ContainerError {
        let err = ContainerError::UnknownKey {
            key: key.to_owned(),
        };
        error!("{}", err);
        err
    }

    fn register_waiter(
        &self,
        mut state: RwLockWriteGuard<RegistryState>,
        key: &str,
    ) -> Receiver<WaitResponse> {
        let (sender, receiver) = oneshot::channel();
        let Some(context) = state.constructing.get_mut(key) else {
            unreachable!("whether `context` exists should be checked before calling this method")
        };
        context.register_waiter(sender);
        debug!(on_thread = ?context.on_thread, "waiting for another thread");
        receiver
    }

    fn wait_for_constructed_object(
        &self,
        receiver: Receiver<WaitResponse>,
    ) -> Option<Result<Arc<dyn Managed>, ContainerError>> {
        match receiver.recv() {
            Ok(WaitResponse::Constructed(value)) => Some(Ok(value)),
            Ok(WaitResponse::Error(err)) => Some(Err(err)),
            Err(_) => None,
        }
    }

    fn construct(
        &self,
        mut state: RwLockWriteGuard<RegistryState>,
        container: &Container,
        key: &str,
        pipeline: Pipeline,
    ) -> Result<Arc<dyn Managed>, ContainerError> {
        let on_thread = thread::current().id();
        state
            .constructing
            .insert(key.to_owned(), ConstructingObjectContext::new(on_thread));
        drop(state);

        let guard = ConstructionGuard::new(self, key);
        debug!(extenders = pipeline.extenders.len(), "constructing");

        match pipeline.run(container, key) {
            Ok(value) => {
                let value: Arc<dyn Managed> = Arc::from(value);
                let mut state = self.state.write();
                state.entries.resolve(key, Arc::clone(&value));
                guard.notify_waiters(state, WaitResponse::Constructed(Arc::clone(&value)));
                debug!("constructed and cached");
                Ok(value)
            }
            Err(err) => {
                // Logged where the error was raised.
                debug!(%err, "construction failed");
                let state = self.state.write();
                guard.notify_waiters(state, WaitResponse::Error(err.clone()));
                Err(err)
            }
        }
    }
}

impl Debug for ContainerCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let state = self.state.read();
        f.debug_map()
            .entries(state.entries.iter().map(|(key, entry)| {
                if state.constructing.contains_key(key) {
                    (key, EntryStatus::Constructing)
                } else {
                    (key, entry.status())
                }
            }))
            .finish()
    }
}

struct RegistryState {
    entries: EntryMap,
    constructing: HashMap<String, ConstructingObjectContext>,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            entries: EntryMap::new(),
            constructing: HashMap::new(),
        }
    }
}

/// The builder and the extenders of a key, detached from the registry so
/// that they run without holding its lock.
struct Pipeline {
    builder: Arc<dyn Builder>,
    extenders: Vec<Arc<dyn Extender>>,
}

impl Pipeline {
    fn new(builder: Arc<dyn Builder>, extenders: Vec<Arc<dyn Extender>>) -> Self {
        Self { builder, extenders }
    }

    fn run(&self, container: &Container, key: &str) -> Result<Box<dyn Managed>, ContainerError> {
        let value = self.builder.dyn_build(container, key)?;
        self.extenders
            .iter()
            .try_fold(value, |value, extender| {
                extender.dyn_extend(value, container, key)
            })
    }
}

struct ConstructingObjectContext {
    on_thread: ThreadId,
    waiters: Vec<Sender<WaitResponse>>,
}

impl ConstructingObjectContext {
    fn new(on_thread: ThreadId) -> Self {
        Self {
            on_thread,
            waiters: Vec::new(),
        }
    }

    fn is_constructed_by_current_thread(&self) -> bool {
        thread::current().id() == self.on_thread
    }

    fn register_waiter(&mut self, sender: Sender<WaitResponse>) {
        self.waiters.push(sender);
    }

    fn notify(self, response: WaitResponse) {
        for sender in self.waiters {
            let _ = sender.send(response.clone());
        }
    }
}

/// Clears the construction mark of a key however the construction ends.
///
/// If the builder chain unwinds, dropping the guard drops every waiter's
/// sender, which wakes the waiters up without a response.
struct ConstructionGuard<'a> {
    core: &'a ContainerCore,
    key: &'a str,
    armed: bool,
}

impl<'a> ConstructionGuard<'a> {
    fn new(core: &'a ContainerCore, key: &'a str) -> Self {
        Self {
            core,
            key,
            armed: true,
        }
    }

    fn notify_waiters(
        mut self,
        mut state: RwLockWriteGuard<RegistryState>,
        response: WaitResponse,
    ) {
        self.armed = false;
        if let Some(context) = state.constructing.remove(self.key) {
            drop(state);
            context.notify(response);
        }
    }
}

impl Drop for ConstructionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core.state.write().constructing.remove(self.key);
        }
    }
}

#[derive(Clone)]
enum WaitResponse {
    Constructed(Arc<dyn Managed>),
    Error(ContainerError),
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    use tracing_test::traced_test;

    use crate::builder::closure::{ClosureBuilder, ClosureExtender};
    use crate::builder::MockBuilder;
    use crate::util::any::Downcast;

    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct TestService {
        name: String,
    }

    fn closure_builder<T, F>(closure: F) -> Arc<dyn Builder>
    where
        T: Managed,
        F: Fn(&Container) -> T + Send + Sync + 'static,
    {
        Arc::new(ClosureBuilder::new(move |container| {
            Ok::<_, ContainerError>(closure(container))
        }))
    }

    fn suffix_extender(suffix: &'static str) -> Arc<dyn Extender> {
        Arc::new(ClosureExtender::new(move |mut service: TestService, _| {
            service.name.push_str(suffix);
            Ok::<_, ContainerError>(service)
        }))
    }

    #[test]
    #[traced_test]
    fn container_core_resolve_succeeds_and_caches_value() {
        let container = Container::new();
        let core = ContainerCore::new();
        let mut builder = MockBuilder::new();
        builder
            .expect_dyn_build()
            .times(1)
            .returning(|_, _| Ok(Box::new(TestService::default())));
        core.insert_builder("svc", Arc::new(builder)).unwrap();

        let first = core.resolve(&container, "svc").unwrap();
        let second = core.resolve(&container, "svc").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(core.status("svc"), Some(EntryStatus::Resolved));
        assert!(logs_contain("constructed and cached"));
        assert!(logs_contain("found in cache"));
    }

    #[test]
    fn container_core_resolve_applies_extenders_in_order() {
        let container = Container::new();
        let core = ContainerCore::new();
        core.insert_builder("svc", closure_builder(|_| TestService::default()))
            .unwrap();
        core.push_extender("svc", suffix_extender("1")).unwrap();
        core.push_extender("svc", suffix_extender("2")).unwrap();

        let service = core
            .resolve(&container, "svc")
            .unwrap()
            .downcast::<TestService>()
            .unwrap_or_else(|_| panic!("`svc` should be a `TestService`"));
        assert_eq!(service.name, "12");
    }

    #[test]
    fn container_core_resolve_fails_when_extender_type_differs() {
        let container = Container::new();
        let core = ContainerCore::new();
        core.insert_builder("svc", closure_builder(|_| 42i32)).unwrap();
        core.push_extender("svc", suffix_extender("1")).unwrap();

        assert!(matches!(
            core.resolve(&container, "svc"),
            Err(ContainerError::TypeMismatch { found: "i32", .. })
        ));
        assert_eq!(
            core.status("svc"),
            Some(EntryStatus::Pending { extenders: 1 })
        );
    }

    #[test]
    #[traced_test]
    fn container_core_resolve_fails_when_key_not_found() {
        let container = Container::new();
        let core = ContainerCore::new();

        assert!(matches!(
            core.resolve(&container, "missing"),
            Err(ContainerError::UnknownKey { .. })
        ));
        assert!(logs_contain(
            "could not find any service registered under the key missing"
        ));
    }

    #[test]
    fn container_core_resolve_retries_after_failed_construction() {
        let container = Container::new();
        let core = ContainerCore::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        core.insert_builder(
            "svc",
            Arc::new(ClosureBuilder::new(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first attempt fails")
                } else {
                    Ok(TestService::default())
                }
            })),
        )
        .unwrap();

        assert!(matches!(
            core.resolve(&container, "svc"),
            Err(ContainerError::Construction { .. })
        ));
        assert!(core.resolve(&container, "svc").is_ok());
        assert!(core.resolve(&container, "svc").is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn container_core_resolve_fails_when_there_exists_cyclic_dependency() {
        let container = Container::new();
        container
            .try_set("a", |container: &Container| -> Result<i32, ContainerError> {
                Ok(*container.get::<i32>("b")?)
            })
            .unwrap();
        container
            .try_set("b", |container: &Container| -> Result<i32, ContainerError> {
                Ok(*container.get::<i32>("a")?)
            })
            .unwrap();

        assert!(matches!(
            container.dyn_get("a"),
            Err(ContainerError::CyclicDependency { key }) if key == "a"
        ));
        assert_eq!(
            container.status("a"),
            Some(EntryStatus::Pending { extenders: 0 })
        );
        assert_eq!(
            container.status("b"),
            Some(EntryStatus::Pending { extenders: 0 })
        );
    }

    #[test]
    fn container_core_resolve_constructs_once_when_racing() {
        const THREADS: usize = 16;

        let container = Container::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        container
            .set("svc", {
                let calls = Arc::clone(&calls);
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    TestService::default()
                }
            })
            .unwrap();

        let handles = (0..THREADS)
            .map(|_| {
                let container = container.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    container.get::<TestService>("svc").unwrap()
                })
            })
            .collect::<Vec<_>>();
        let services = handles
            .into_iter()
            .map(|h| h.join().expect("Each thread should not `panic!()`"))
            .collect::<Vec<_>>();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(services.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn container_core_resolve_fails_for_every_waiter_when_racing() {
        const THREADS: usize = 6;

        let container = Container::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        container
            .try_set("svc", {
                let calls = Arc::clone(&calls);
                move |_: &Container| -> Result<TestService, &'static str> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Err("broken service")
                }
            })
            .unwrap();

        let handles = (0..THREADS)
            .map(|_| {
                let container = container.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    container.dyn_get("svc").map(|_| ())
                })
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().expect("Each thread should not `panic!()`"))
            .collect::<Vec<_>>();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|res| matches!(
            res,
            Err(ContainerError::Construction { key, .. }) if key == "svc"
        )));
        assert_eq!(
            container.status("svc"),
            Some(EntryStatus::Pending { extenders: 0 })
        );
    }

    #[test]
    fn container_core_resolve_retries_when_constructing_thread_panics() {
        const THREADS: usize = 4;

        let container = Container::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        container
            .set("svc", {
                let calls = Arc::clone(&calls);
                move |_| {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        thread::sleep(Duration::from_millis(50));
                        panic!("the first construction panics");
                    }
                    7i32
                }
            })
            .unwrap();

        let handles = (0..THREADS)
            .map(|_| {
                let container = container.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    container.get::<i32>("svc").map(|v| *v)
                })
            })
            .collect::<Vec<_>>();
        let results = handles.into_iter().map(|h| h.join()).collect::<Vec<_>>();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.iter().filter(|res| res.is_err()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|res| matches!(res, Ok(Ok(7))))
                .count(),
            THREADS - 1
        );
        assert!(container.is_resolved("svc"));
    }

    #[test]
    #[traced_test]
    fn container_core_resolve_logs_nested_errors_once() {
        let container = Container::new();
        container
            .try_set("outer", |container: &Container| -> Result<i32, ContainerError> {
                Ok(*container.get::<i32>("inner")?)
            })
            .unwrap();
        container
            .try_set("inner", |container: &Container| -> Result<i32, ContainerError> {
                Ok(*container.get::<i32>("missing")?)
            })
            .unwrap();

        assert!(matches!(
            container.dyn_get("outer"),
            Err(ContainerError::UnknownKey { key }) if key == "missing"
        ));
        logs_assert(|lines: &[&str]| {
            let count = lines
                .iter()
                .filter(|line| line.contains("ERROR"))
                .filter(|line| line.contains("registered under the key missing"))
                .count();
            match count {
                1 => Ok(()),
                n => Err(format!("the error is logged {n} times")),
            }
        });
    }

    #[test]
    fn container_core_push_extender_fails_while_constructing() {
        let container = Container::new();
        container
            .try_set("svc", |container: &Container| -> Result<_, ContainerError> {
                let res = container.extend("svc", |service: TestService, _| service);
                assert!(matches!(res, Err(ContainerError::AlreadyResolved { .. })));
                assert_eq!(container.status("svc"), Some(EntryStatus::Constructing));
                Ok(TestService::default())
            })
            .unwrap();

        assert!(container.dyn_get("svc").is_ok());
        assert_eq!(container.status("svc"), Some(EntryStatus::Resolved));
    }

    #[test]
    fn container_core_insert_fails_when_key_is_empty() {
        let core = ContainerCore::new();

        assert!(matches!(
            core.insert_value("", Arc::new(1i32)),
            Err(ContainerError::EmptyKey)
        ));
        assert_eq!(core.len(), 0);
    }
}
