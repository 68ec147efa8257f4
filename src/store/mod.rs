//! Reactive store of named, typed profile fields.
//!
//! Every field keeps an optional value and an ordered set of named
//! listeners. Binding a listener replays the current value to it before
//! the bind call returns; every later [`FieldStore::set`] notifies the
//! field's listeners in registration order. Listeners run on the calling
//! thread, outside the state lock, so they may read or write the store
//! again.
//!
//! Updating a value and notifying its listeners happen under one delivery
//! lock, so concurrent writers reach every listener in the order their
//! values were stored, and a fresh binding gets its replay before any
//! later write. The lock is reentrant: a listener may write on its own
//! thread, but must not block on another thread that writes.

pub mod field;
pub mod persistence;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use parking_lot::ReentrantMutex;

use crate::config::ProfileConfig;
use crate::Result;

pub use field::{Badge, Field, FieldValue};
pub use persistence::{FileStorage, MemoryStorage, Persistence};

const DEFAULTS_LABEL: &str = "profile-defaults";

type Callback<T> = Arc<dyn Fn(Option<T>) + Send + Sync>;

struct Binding<T> {
    name: String,
    id: u64,
    callback: Callback<T>,
}

struct Slot<T> {
    value: Option<T>,
    bindings: Vec<Binding<T>>,
}

trait AnySlot: Send {
    fn remove_named(&mut self, name: &str) -> bool;
    fn remove_binding(&mut self, name: &str, id: u64) -> bool;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: FieldValue> AnySlot for Slot<T> {
    fn remove_named(&mut self, name: &str) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.name != name);
        before != self.bindings.len()
    }

    fn remove_binding(&mut self, name: &str, id: u64) -> bool {
        let before = self.bindings.len();
        self.bindings
            .retain(|b| !(b.name == name && b.id == id));
        before != self.bindings.len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct StoreState {
    slots: HashMap<&'static str, Box<dyn AnySlot>>,
    persistence: Box<dyn Persistence>,
    next_binding: u64,
}

impl StoreState {
    /// Typed slot for `field`, seeded from persistence on first use.
    /// `None` if the key is already bound to a different value type.
    fn slot<T: FieldValue>(&mut self, field: Field<T>) -> Option<&mut Slot<T>> {
        if !self.slots.contains_key(field.key()) {
            let value = self
                .persistence
                .string(field.key())
                .and_then(|raw| T::decode(&raw));
            log::trace!(
                "field-store: seeding {} (present: {})",
                field.key(),
                value.is_some()
            );
            self.slots.insert(
                field.key(),
                Box::new(Slot::<T> {
                    value,
                    bindings: Vec::new(),
                }),
            );
        }

        let slot = self
            .slots
            .get_mut(field.key())?
            .as_any_mut()
            .downcast_mut::<Slot<T>>();
        if slot.is_none() {
            log::error!(
                "field-store: {} is registered with another value type",
                field.key()
            );
        }
        slot
    }
}

/// Process-wide store of profile fields.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct FieldStore {
    state: Arc<Mutex<StoreState>>,
    delivery: Arc<ReentrantMutex<()>>,
}

impl FieldStore {
    pub fn new(persistence: impl Persistence + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                slots: HashMap::new(),
                persistence: Box::new(persistence),
                next_binding: 0,
            })),
            delivery: Arc::new(ReentrantMutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    /// Open the store described by `config`: file-backed when a defaults
    /// path is configured, volatile otherwise.
    pub fn init(config: &ProfileConfig) -> Result<Self> {
        match &config.defaults_path {
            Some(path) => {
                let storage =
                    FileStorage::open(DEFAULTS_LABEL.to_owned(), path)?;
                log::info!(
                    "field-store: using {} for persistence",
                    path.display()
                );
                Ok(Self::new(storage))
            }
            None => Ok(Self::in_memory()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<T: FieldValue>(&self, field: Field<T>) -> Option<T> {
        let mut state = self.lock();
        state.slot(field).and_then(|slot| slot.value.clone())
    }

    /// Store `value` and notify every listener of `field`.
    ///
    /// The value is written through to persistence. No equality check is
    /// made here: callers wanting "no-op when unchanged" compare first.
    pub fn set<T: FieldValue>(&self, field: Field<T>, value: T) {
        self.store(field, Some(value))
    }

    /// Reset `field` to absent and notify its listeners.
    pub fn unset<T: FieldValue>(&self, field: Field<T>) {
        self.store(field, None)
    }

    fn store<T: FieldValue>(&self, field: Field<T>, value: Option<T>) {
        let _delivery = self.delivery.lock();
        let callbacks: Vec<Callback<T>> = {
            let mut state = self.lock();
            let encoded = value.as_ref().map(FieldValue::encode);
            if let Err(e) = state
                .persistence
                .set_string(field.key(), encoded.as_deref())
            {
                log::error!(
                    "field-store: failed to persist {}: {}",
                    field.key(),
                    e
                );
            }

            let Some(slot) = state.slot(field) else {
                return;
            };
            slot.value = value.clone();
            slot.bindings
                .iter()
                .map(|b| b.callback.clone())
                .collect()
        };

        log::debug!(
            "field-store: {} updated, notifying {} listeners",
            field.key(),
            callbacks.len()
        );
        for callback in callbacks {
            callback(value.clone());
        }
    }

    /// Register `callback` under `name` and replay the current value to
    /// it before returning.
    ///
    /// A previous binding with the same name is replaced in place, keeping
    /// its position in the notification order.
    pub fn bind_and_fire<T, F>(
        &self,
        field: Field<T>,
        name: &str,
        callback: F,
    ) -> Subscription
    where
        T: FieldValue,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let _delivery = self.delivery.lock();
        let (id, current) = {
            let mut state = self.lock();
            let id = state.next_binding;
            state.next_binding += 1;

            let current = match state.slot(field) {
                Some(slot) => {
                    let binding = Binding {
                        name: name.to_owned(),
                        id,
                        callback: callback.clone(),
                    };
                    match slot.bindings.iter_mut().find(|b| b.name == name) {
                        Some(existing) => *existing = binding,
                        None => slot.bindings.push(binding),
                    }
                    slot.value.clone()
                }
                None => None,
            };
            (id, current)
        };

        log::trace!("field-store: bound {} on {}", name, field.key());
        callback(current);

        Subscription {
            state: Arc::downgrade(&self.state),
            key: field.key(),
            name: name.to_owned(),
            id,
            active: true,
        }
    }

    /// Remove the listener registered under `name`; no-op if there is none.
    pub fn remove_listener<T: FieldValue>(&self, field: Field<T>, name: &str) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(field.key()) {
            if slot.remove_named(name) {
                log::trace!(
                    "field-store: removed {} from {}",
                    name,
                    field.key()
                );
            }
        }
    }

    /// Reset every field to absent, drop every listener and erase the
    /// persisted values.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.slots.clear();
        if let Err(e) = state.persistence.erase() {
            log::error!("field-store: failed to erase persistence: {}", e);
        }
        log::info!("field-store: cleared");
    }
}

/// Handle to a listener binding.
///
/// Disposing (or dropping) the handle removes the binding, unless it was
/// already removed or replaced by a newer binding under the same name.
#[must_use = "dropping a subscription removes its listener"]
pub struct Subscription {
    state: Weak<Mutex<StoreState>>,
    key: &'static str,
    name: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispose(mut self) {
        self.release();
    }

    /// Keep the binding alive after the handle is gone; it then lives
    /// until [`FieldStore::remove_listener`] or [`FieldStore::clear`].
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = state.slots.get_mut(self.key) {
            slot.remove_binding(&self.name, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
