use std::cell::{Ref, RefCell, RefMut};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

pub struct WrappedRcRefCell<T: ?Sized> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    pub fn wrap(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(value)),
        }
    }

    /// Panics if the value is mutably borrowed elsewhere.
    pub fn get(&self) -> Ref<T> {
        self.inner.borrow()
    }

    /// Panics if the value is borrowed elsewhere.
    pub fn get_mut(&self) -> RefMut<T> {
        self.inner.borrow_mut()
    }
}

impl<T: Default> Default for WrappedRcRefCell<T> {
    fn default() -> Self {
        Self::wrap(T::default())
    }
}

impl<T: ?Sized> Clone for WrappedRcRefCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> PartialEq for WrappedRcRefCell<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Eq for WrappedRcRefCell<T> {}

impl<T: ?Sized> Hash for WrappedRcRefCell<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.inner) as *const () as usize).hash(state);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for WrappedRcRefCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
