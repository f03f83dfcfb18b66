use indexmap::IndexSet;

/// Insertion-ordered key set that evicts its oldest key once full.
#[derive(Debug)]
pub(crate) struct KeyCache {
    keys: IndexSet<String>,
    max_size: usize,
}

impl KeyCache {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            keys: IndexSet::new(),
            max_size: max_size.max(1),
        }
    }

    pub(crate) fn insert(&mut self, key: &str) -> bool {
        if self.keys.contains(key) {
            return false;
        }
        if self.keys.len() >= self.max_size {
            self.keys.shift_remove_index(0);
        }
        self.keys.insert(key.to_string())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.keys.shift_remove(key)
    }

    pub(crate) fn clear(&mut self) {
        self.keys.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &String> {
        self.keys.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut cache = KeyCache::new(2);
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(!cache.insert("a"));
        assert!(cache.insert("c"));

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }
}
