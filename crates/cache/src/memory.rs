use crate::{ContentCache, checked};
use khetworld_common::{Khet, KhetId};
use std::cell::RefCell;
use std::collections::HashMap;

/// Process-local cache. Used when no cache directory is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: RefCell<HashMap<KhetId, Khet>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids currently cached, in no particular order.
    pub fn ids(&self) -> Vec<KhetId> {
        self.records.borrow().keys().cloned().collect()
    }
}

impl ContentCache for MemoryCache {
    fn get(&self, id: &KhetId) -> Option<Khet> {
        let record = self.records.borrow().get(id).cloned()?;
        checked(id, record)
    }

    fn put(&self, khet: &Khet) -> bool {
        self.records
            .borrow_mut()
            .insert(khet.id.clone(), khet.clone());
        true
    }

    fn remove(&self, id: &KhetId) -> bool {
        self.records.borrow_mut().remove(id).is_some()
    }

    fn len(&self) -> usize {
        self.records.borrow().len()
    }
}
