use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use indexmap::map::Entry as MapEntry;
use indexmap::IndexMap;

use crate::builder::{Builder, Extender};
use crate::container::{ContainerError, Managed};

/// A snapshot of the lifecycle state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Registered with a builder, not resolved yet.
    Pending { extenders: usize },
    /// A builder-backed entry being resolved right now.
    Constructing,
    /// Registered with a builder and resolved.
    Resolved,
    /// Registered with a value directly.
    Static,
}

impl EntryStatus {
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved | Self::Static)
    }
}

pub(super) enum Entry {
    Pending {
        builder: Arc<dyn Builder>,
        extenders: Vec<Arc<dyn Extender>>,
    },
    Resolved {
        value: Arc<dyn Managed>,
        is_static: bool,
    },
}

impl Entry {
    pub fn new_pending(builder: Arc<dyn Builder>) -> Self {
        Self::Pending {
            builder,
            extenders: Vec::new(),
        }
    }

    pub fn new_static(value: Arc<dyn Managed>) -> Self {
        Self::Resolved {
            value,
            is_static: true,
        }
    }

    pub fn status(&self) -> EntryStatus {
        match self {
            Self::Pending { extenders, .. } => EntryStatus::Pending {
                extenders: extenders.len(),
            },
            Self::Resolved {
                is_static: true, ..
            } => EntryStatus::Static,
            Self::Resolved { .. } => EntryStatus::Resolved,
        }
    }
}

impl Debug for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Pending { extenders, .. } => f
                .debug_struct("Pending")
                .field("extenders", &extenders.len())
                .finish_non_exhaustive(),
            Self::Resolved { value, is_static } => f
                .debug_struct("Resolved")
                .field("type", &(**value).type_name())
                .field("is_static", is_static)
                .finish(),
        }
    }
}

/// Entries keyed by name, kept in first-registration order.
#[derive(Debug, Default)]
pub(super) struct EntryMap {
    entries: IndexMap<String, Entry>,
}

impl EntryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, entry: Entry) -> Result<(), ContainerError> {
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(_) => Err(ContainerError::DuplicateKey {
                key: key.to_owned(),
            }),
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn push_extender(
        &mut self,
        key: &str,
        extender: Arc<dyn Extender>,
    ) -> Result<(), ContainerError> {
        match self.entries.get_mut(key) {
            Some(Entry::Pending { extenders, .. }) => {
                extenders.push(extender);
                Ok(())
            }
            Some(Entry::Resolved { .. }) => Err(ContainerError::AlreadyResolved {
                key: key.to_owned(),
            }),
            None => Err(ContainerError::UnknownKey {
                key: key.to_owned(),
            }),
        }
    }

    /// Replaces a pending entry by its constructed value. The transition
    /// happens once; a resolved entry is never overwritten.
    pub fn resolve(&mut self, key: &str, value: Arc<dyn Managed>) {
        if let Some(entry) = self.entries.get_mut(key) {
            if matches!(entry, Entry::Pending { .. }) {
                *entry = Entry::Resolved {
                    value,
                    is_static: false,
                };
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
