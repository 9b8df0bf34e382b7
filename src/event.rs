use parking_lot::RwLock;
use std::sync::Arc;

/// Copy-on-write listener list. Mutation swaps in a new vector, so a
/// snapshot taken for notification is never torn by concurrent add/remove.
pub struct ListenerList<L: ?Sized> {
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for ListenerList<L> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) {
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Removes the first registration of this exact listener instance.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        let Some(pos) = guard.iter().position(|l| Arc::ptr_eq(l, listener)) else {
            return false;
        };
        let mut next: Vec<Arc<L>> = (**guard).clone();
        next.remove(pos);
        *guard = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        Arc::clone(&self.listeners.read())
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
