//! The current store of the calling thread.
//!
//! Code that resolves refs without an explicit store handle goes through the
//! current store. Switching it is always scoped: [`StoreScope`] restores the
//! previous store when dropped, including while unwinding.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::traits::CellStore;

thread_local! {
    static CURRENT: RefCell<Option<Arc<dyn CellStore>>> = const { RefCell::new(None) };
}

/// The store in scope on this thread, if any.
pub fn current_store() -> Option<Arc<dyn CellStore>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Like [`current_store`], but an error when no store is in scope.
pub fn require_current_store() -> StoreResult<Arc<dyn CellStore>> {
    current_store().ok_or(StoreError::NoCurrentStore)
}

fn replace_current(store: Option<Arc<dyn CellStore>>) -> Option<Arc<dyn CellStore>> {
    CURRENT.with(|c| c.replace(store))
}

/// Guard that makes a store current until dropped.
///
/// Guards nest; each restores exactly what it replaced. A guard is tied to
/// the thread that created it.
#[must_use = "the store is only current while the guard is alive"]
pub struct StoreScope {
    previous: Option<Arc<dyn CellStore>>,
    _not_send: PhantomData<*const ()>,
}

impl StoreScope {
    pub fn enter(store: Arc<dyn CellStore>) -> Self {
        Self {
            previous: replace_current(Some(store)),
            _not_send: PhantomData,
        }
    }
}

impl Drop for StoreScope {
    fn drop(&mut self) {
        replace_current(self.previous.take());
    }
}

/// Run `f` with `store` current, restoring the previous store afterwards.
pub fn with_store<R>(store: Arc<dyn CellStore>, f: impl FnOnce() -> R) -> R {
    let _scope = StoreScope::enter(store);
    f()
}
