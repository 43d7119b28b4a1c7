///
/// Context-key registry.
///
/// SQLite hands every trampoline back the `void*` context it was registered
/// with. Instead of boxing closures into raw pointers, the adapter registers
/// an integer `ContextKey` as that context and keeps the closure here:
///
/// - `registrations`: key → closure plus the handle and slot it serves
/// - `active`: (handle, slot) → key currently registered with SQLite
///
/// Registration is two-phase. `stage` stores the closure under a fresh key
/// before SQLite sees it; once SQLite accepted the key, `activate` binds it
/// to the slot and hands back whatever it superseded. Releases happen by key
/// (`discard`, also reached from SQLite's `xDestroy`), by slot (`deactivate`)
/// or per handle (`release_handle`). All of them are idempotent.
///
/// Released closures are returned to the caller so they drop after the
/// registry lock is gone. The lock is never held while SQLite or a closure
/// runs.
///

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use crate::function::FunctionContext;
use crate::slot::{Slot, UpdateOperation};
use crate::tokenizer::TokenSpan;

pub type BusyFn = dyn FnMut(i32) -> bool + Send;
pub type TraceFn = dyn FnMut(&str) + Send;
pub type UpdateFn = dyn FnMut(UpdateOperation, &str, &str, i64) + Send;
pub type CommitFn = dyn FnMut() -> bool + Send;
pub type RollbackFn = dyn FnMut() + Send;
pub type FunctionFn = dyn FnMut(&mut FunctionContext<'_>) + Send;
pub type CollationFn = dyn FnMut(&str, &str) -> CmpOrdering + Send;
pub type TokenizeFn = dyn FnMut(&str, &mut TokenSpan) -> Option<String> + Send;

pub(crate) type Shared<F> = Arc<Mutex<F>>;

/// A registered closure, tagged with the slot kind whose trampoline runs it.
#[derive(Clone)]
pub(crate) enum Callback {
    Busy(Shared<BusyFn>),
    Trace { callback: Shared<TraceFn>, expanded: bool },
    Update(Shared<UpdateFn>),
    Commit(Shared<CommitFn>),
    Rollback(Shared<RollbackFn>),
    Function(Shared<FunctionFn>),
    Collation(Shared<CollationFn>),
    Tokenizer(Shared<TokenizeFn>),
}

/// Runs a shared closure. A poisoned closure mutex still yields the closure;
/// panics never unwind out of a trampoline anyway.
pub(crate) fn invoke<F: ?Sized, R>(shared: &Shared<F>, call: impl FnOnce(&mut F) -> R) -> R {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    call(&mut guard)
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a `Handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The value SQLite stores as a callback's `void*` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ContextKey(NonZeroU64);

impl ContextKey {
    pub(crate) fn as_ptr(self) -> *mut c_void {
        std::ptr::without_provenance_mut(self.0.get() as usize)
    }

    pub(crate) fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonZeroU64::new(ptr.addr() as u64).map(ContextKey)
    }
}

pub(crate) struct Registration {
    pub(crate) handle: HandleId,
    pub(crate) slot: Slot,
    callback: Callback,
}

struct Registry {
    next_key: u64,
    registrations: HashMap<ContextKey, Registration>,
    active: HashMap<(HandleId, Slot), ContextKey>,
}

impl Registry {
    fn new() -> Self {
        Self {
            next_key: 1,
            registrations: HashMap::new(),
            active: HashMap::new(),
        }
    }

    fn mint(&mut self) -> ContextKey {
        loop {
            let raw = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            if let Some(key) = NonZeroU64::new(raw).map(ContextKey) {
                if !self.registrations.contains_key(&key) {
                    return key;
                }
            }
        }
    }

    fn remove(&mut self, key: ContextKey) -> Option<Registration> {
        let registration = self.registrations.remove(&key)?;
        let binding = (registration.handle, registration.slot.clone());
        if self.active.get(&binding) == Some(&key) {
            self.active.remove(&binding);
        }
        Some(registration)
    }
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::new()));

fn lock() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stores a closure under a fresh key without binding it to its slot.
pub(crate) fn stage(handle: HandleId, slot: Slot, callback: Callback) -> ContextKey {
    let mut reg = lock();
    let key = reg.mint();
    reg.registrations.insert(
        key,
        Registration {
            handle,
            slot,
            callback,
        },
    );
    key
}

/// Binds a staged key to its slot, returning the registration it replaced.
pub(crate) fn activate(key: ContextKey) -> Option<Registration> {
    let mut reg = lock();
    let binding = {
        let registration = reg.registrations.get(&key)?;
        (registration.handle, registration.slot.clone())
    };
    let previous = reg.active.insert(binding, key)?;
    if previous == key {
        return None;
    }
    reg.registrations.remove(&previous)
}

pub(crate) fn discard(key: ContextKey) -> Option<Registration> {
    lock().remove(key)
}

pub(crate) fn deactivate(handle: HandleId, slot: &Slot) -> Option<Registration> {
    let mut reg = lock();
    let key = reg.active.remove(&(handle, slot.clone()))?;
    reg.registrations.remove(&key)
}

/// Removes every registration owned by a handle, staged or active.
pub(crate) fn release_handle(handle: HandleId) -> Vec<Registration> {
    let mut reg = lock();
    reg.active.retain(|(owner, _), _| *owner != handle);
    let keys: Vec<ContextKey> = reg
        .registrations
        .iter()
        .filter(|(_, registration)| registration.handle == handle)
        .map(|(key, _)| *key)
        .collect();
    keys.into_iter()
        .filter_map(|key| reg.registrations.remove(&key))
        .collect()
}

pub(crate) fn resolve(key: ContextKey) -> Option<Callback> {
    lock()
        .registrations
        .get(&key)
        .map(|registration| registration.callback.clone())
}

pub(crate) fn resolve_active(handle: HandleId, slot: &Slot) -> Option<Callback> {
    let reg = lock();
    let key = reg.active.get(&(handle, slot.clone()))?;
    reg.registrations
        .get(key)
        .map(|registration| registration.callback.clone())
}

pub(crate) fn is_active(handle: HandleId, slot: &Slot) -> bool {
    lock().active.contains_key(&(handle, slot.clone()))
}

/// Number of closures a handle currently keeps alive.
pub(crate) fn registration_count(handle: HandleId) -> usize {
    lock()
        .registrations
        .values()
        .filter(|registration| registration.handle == handle)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollback_callback(counter: Arc<AtomicU64>) -> Callback {
        Callback::Rollback(Arc::new(Mutex::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
    }

    #[test]
    fn test_context_key_pointer_round_trip() {
        let handle = HandleId::next();
        let key = stage(handle, Slot::RollbackHook, rollback_callback(Arc::default()));
        let ptr = key.as_ptr();
        assert!(!ptr.is_null());
        assert_eq!(ContextKey::from_ptr(ptr), Some(key));
        assert_eq!(ContextKey::from_ptr(std::ptr::null_mut()), None);
        drop(discard(key));
    }

    #[test]
    fn test_activate_replaces_previous() {
        let handle = HandleId::next();
        let first = stage(handle, Slot::RollbackHook, rollback_callback(Arc::default()));
        assert!(activate(first).is_none());
        assert!(is_active(handle, &Slot::RollbackHook));

        let second = stage(handle, Slot::RollbackHook, rollback_callback(Arc::default()));
        let replaced = activate(second).expect("first registration is superseded");
        assert_eq!(replaced.handle, handle);
        assert!(resolve(first).is_none());
        assert!(resolve(second).is_some());
        assert_eq!(registration_count(handle), 1);

        drop(release_handle(handle));
    }

    #[test]
    fn test_staged_key_is_invisible_to_slot() {
        let handle = HandleId::next();
        let key = stage(handle, Slot::CommitHook, rollback_callback(Arc::default()));
        assert!(!is_active(handle, &Slot::CommitHook));
        assert!(resolve(key).is_some());
        assert!(discard(key).is_some());
        assert!(discard(key).is_none());
    }

    #[test]
    fn test_discard_unbinds_active_slot() {
        let handle = HandleId::next();
        let key = stage(handle, Slot::collation("c"), rollback_callback(Arc::default()));
        activate(key);
        drop(discard(key));
        assert!(!is_active(handle, &Slot::collation("c")));
        assert!(deactivate(handle, &Slot::collation("c")).is_none());
    }

    #[test]
    fn test_release_handle_only_touches_its_own_slots() {
        let mine = HandleId::next();
        let other = HandleId::next();
        activate(stage(mine, Slot::Trace, rollback_callback(Arc::default())));
        activate(stage(mine, Slot::function("f", 1), rollback_callback(Arc::default())));
        activate(stage(other, Slot::Trace, rollback_callback(Arc::default())));

        let released = release_handle(mine);
        assert_eq!(released.len(), 2);
        assert_eq!(registration_count(mine), 0);
        assert!(is_active(other, &Slot::Trace));

        drop(release_handle(other));
    }

    #[test]
    fn test_released_closure_is_dropped() {
        let handle = HandleId::next();
        let counter = Arc::new(AtomicU64::new(0));
        let key = stage(handle, Slot::RollbackHook, rollback_callback(counter.clone()));
        activate(key);
        assert_eq!(Arc::strong_count(&counter), 2);
        drop(deactivate(handle, &Slot::RollbackHook));
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
