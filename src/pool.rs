//! Request-scoped arena.
//!
//! Every per-request object in the original design is bump-allocated from a
//! pool that is dropped as a unit at request completion; no individual
//! `free()` exists. Rust's ownership model already gives us group-drop for
//! free once objects share a root, so `Pool` here is a thin *lifetime root*:
//! it holds the last strong reference to everything allocated through it, and
//! hands callers a [`PoolRef`] (a weak handle) rather than a raw pointer.
//! Once the pool (and every clone of it) is dropped, every `PoolRef::get()`
//! for that generation returns `None` instead of dereferencing freed memory
//! — the invariant "no access to a pool-allocated pointer after pool release"
//! is enforced by the type system instead of by poisoning memory.
//!
//! Pools nest: a child pool keeps its parent alive (via a strong reference)
//! for its own lifetime, mirroring the original's nested-pool / attach
//! semantics, where attaching a foreign object to a pool ties its lifetime to
//! that pool's.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

struct Inner {
    // Kept alive only to extend the parent's lifetime to at least ours.
    _parent: Option<Pool>,
    slots: RefCell<Vec<Rc<dyn Any>>>,
}

/// A request-scoped allocation arena.
#[derive(Clone)]
pub struct Pool {
    inner: Rc<Inner>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Creates a new root pool.
    pub fn new() -> Self {
        Pool {
            inner: Rc::new(Inner {
                _parent: None,
                slots: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Creates a child pool whose lifetime is bounded by `self`'s.
    pub fn child(&self) -> Pool {
        Pool {
            inner: Rc::new(Inner {
                _parent: Some(self.clone()),
                slots: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Allocates `value` from this pool, returning an owning handle and a
    /// weak [`PoolRef`] that other request-scoped objects can hold without
    /// extending its lifetime past the pool's own drop.
    pub fn alloc<T: 'static>(&self, value: T) -> (Rc<T>, PoolRef<T>) {
        let rc = Rc::new(value);
        self.inner.slots.borrow_mut().push(rc.clone());
        let weak = Rc::downgrade(&rc);
        (rc, PoolRef { weak })
    }

    /// Attaches an already-owned value to this pool: the pool keeps it alive
    /// until the pool itself is dropped, even if every other reference to it
    /// is dropped first. Used for foreign objects (e.g. an upstream lease)
    /// that must outlive the request but have no other anchor.
    pub fn attach<T: 'static>(&self, value: Rc<T>) {
        self.inner.slots.borrow_mut().push(value);
    }

    /// Number of objects directly allocated from this pool (not children).
    pub fn len(&self) -> usize {
        self.inner.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A handle to a pool-allocated value that does not keep it alive.
pub struct PoolRef<T: 'static> {
    weak: Weak<T>,
}

impl<T: 'static> PoolRef<T> {
    /// Upgrades to a strong reference, or `None` if the owning pool (and
    /// every other strong reference) has already been dropped.
    pub fn get(&self) -> Option<Rc<T>> {
        self.weak.upgrade()
    }
}

impl<T: 'static> Clone for PoolRef<T> {
    fn clone(&self) -> Self {
        PoolRef {
            weak: self.weak.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_survives_while_pool_alive() {
        let pool = Pool::new();
        let (_owned, handle) = pool.alloc(42u32);
        assert_eq!(*handle.get().unwrap(), 42);
    }

    #[test]
    fn handle_dangles_safely_after_pool_drop() {
        let handle = {
            let pool = Pool::new();
            let (_owned, handle) = pool.alloc(String::from("hello"));
            handle
            // pool and _owned drop here
        };
        assert!(handle.get().is_none());
    }

    #[test]
    fn child_pool_keeps_parent_alive() {
        let handle = {
            let parent = Pool::new();
            let (_owned, parent_handle) = parent.alloc(7u32);
            let child = parent.child();
            drop(parent);
            // parent_handle still resolves: child pool holds parent alive.
            assert!(parent_handle.get().is_some());
            drop(child);
            parent_handle
        };
        assert!(handle.get().is_none());
    }

    #[test]
    fn attach_extends_lifetime_past_other_owners() {
        let rc = Rc::new(String::from("leased"));
        let pool = Pool::new();
        pool.attach(rc.clone());
        drop(rc);
        assert_eq!(pool.len(), 1);
    }
}
