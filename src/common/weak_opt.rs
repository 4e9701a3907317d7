use std::sync::{Arc, Weak};

// This is because `Weak::new()` *allocates* space for `T`, even if it
// doesn't need it!
pub(crate) struct WeakOpt<T>(Option<Weak<T>>);

impl<T> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        WeakOpt(self.0.clone())
    }
}

impl<T> WeakOpt<T> {
    pub(crate) fn none() -> Self {
        WeakOpt(None)
    }

    pub(crate) fn downgrade(arc: &Arc<T>) -> Self {
        WeakOpt(Some(Arc::downgrade(arc)))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }
}
