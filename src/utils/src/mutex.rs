// Portable stand-in for the macOS `os_unfair_lock` wrapper this crate used to carry.
// Built on `parking_lot` so the rest of the tree can run on any host platform;
// the `.lock().unwrap()` call shape is kept so call sites don't need to change.

use std::ops::{Deref, DerefMut};

pub struct Mutex<T: ?Sized>(parking_lot::Mutex<T>);

pub struct MutexGuard<'a, T: ?Sized>(parking_lot::MutexGuard<'a, T>);

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex(parking_lot::Mutex::new(value))
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    #[allow(clippy::result_unit_err)]
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, ()> {
        Ok(MutexGuard(self.0.lock()))
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.0.try_lock().map(MutexGuard)
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex(parking_lot::Mutex::new(T::default()))
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::Mutex;

    #[test]
    fn basics() {
        let m = Mutex::new(42);
        *m.lock().unwrap() += 1;
        assert_eq!(*m.lock().unwrap(), 43);
        assert_eq!(m.into_inner(), 43);
    }
}
