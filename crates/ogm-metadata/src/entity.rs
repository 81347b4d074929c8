//! Shared entity handles.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// A mapped instance, shared between the caller and the session.
///
/// Loads update instances in place through the lock, so every clone of the
/// handle observes the latest database state.
pub type Entity<T> = Arc<RwLock<T>>;

/// Wrap a value into a shareable entity handle.
pub fn entity<T>(value: T) -> Entity<T> {
    Arc::new(RwLock::new(value))
}

/// A type-erased entity handle.
///
/// Two `EntityRef`s are the same entity exactly when they point at the same
/// allocation; the wrapped type's own equality is never consulted.
#[derive(Clone)]
pub struct EntityRef {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl EntityRef {
    pub fn new<T: Send + Sync + 'static>(entity: &Entity<T>) -> Self {
        Self {
            inner: entity.clone(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Address of the shared allocation. Stable for as long as any handle
    /// to the entity is alive.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        self.address() == other.address()
    }

    /// Rust type name of the wrapped value, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Key used to find the descriptor bound to the wrapped type.
    pub fn lock_type_id(&self) -> TypeId {
        Any::type_id(self.inner.as_ref())
    }

    pub fn is<T: Send + Sync + 'static>(&self) -> bool {
        self.lock_type_id() == TypeId::of::<RwLock<T>>()
    }

    /// Recover the typed handle.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Entity<T>> {
        Arc::clone(&self.inner).downcast::<RwLock<T>>().ok()
    }

    /// Run `f` against a read guard of the wrapped value.
    pub fn read_with<T: Send + Sync + 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let lock = self.inner.downcast_ref::<RwLock<T>>()?;
        let guard = lock.read();
        Some(f(&guard))
    }

    /// Run `f` against a write guard of the wrapped value.
    pub fn write_with<T: Send + Sync + 'static, R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let lock = self.inner.downcast_ref::<RwLock<T>>()?;
        let mut guard = lock.write();
        Some(f(&mut guard))
    }
}

impl<T: Send + Sync + 'static> From<&Entity<T>> for EntityRef {
    fn from(entity: &Entity<T>) -> Self {
        EntityRef::new(entity)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({}@{:#x})", self.type_name, self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Eq, Hash)]
    struct Tag {
        name: String,
    }

    #[test]
    fn test_identity_is_allocation() {
        let a = entity(Tag::default());
        let b = entity(Tag::default());
        assert_eq!(*a.read(), *b.read());

        let ra = EntityRef::new(&a);
        let ra2 = EntityRef::new(&a.clone());
        let rb = EntityRef::new(&b);
        assert!(ra.ptr_eq(&ra2));
        assert!(!ra.ptr_eq(&rb));
    }

    #[test]
    fn test_downcast() {
        let a = entity(Tag {
            name: "x".to_string(),
        });
        let r = EntityRef::new(&a);
        assert!(r.is::<Tag>());
        assert!(!r.is::<String>());
        assert!(r.downcast::<String>().is_none());

        let back = r.downcast::<Tag>().unwrap();
        assert!(Arc::ptr_eq(&back, &a));
        assert_eq!(r.read_with(|t: &Tag| t.name.clone()).unwrap(), "x");

        r.write_with(|t: &mut Tag| t.name = "y".to_string()).unwrap();
        assert_eq!(a.read().name, "y");
    }
}
