//! Append-only string interning for location and street names.

use std::collections::HashMap;
use std::sync::Arc;

/// Maps repeated strings to small integer ids.
///
/// Ids are assigned in order of first sight (`id == len()` at insertion)
/// and never change, so a [`crate::SummaryPoint`] can reference a name by
/// id for the lifetime of the table.
#[derive(Debug, Default, Clone)]
pub struct StringTable {
    values: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, u32>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `value`, inserting it if unseen.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` distinct strings are interned.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = u32::try_from(self.values.len()).expect("string table overflow");
        let shared: Arc<str> = Arc::from(value);
        self.values.push(Arc::clone(&shared));
        self.ids.insert(shared, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&str> {
        self.values.get(id as usize).map(AsRef::as_ref)
    }

    /// Id of `value` if it has been interned.
    #[must_use]
    pub fn lookup(&self, value: &str) -> Option<u32> {
        self.ids.get(value).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
