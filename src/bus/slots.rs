// Index-addressed storage for pucks and groups.
//
// IDs on the bus are small and sparse (pucks 1..7 plus the safety module at
// 10, groups by GRPB), so entries live in a vector indexed by ID with
// vacant gaps.

/// Vector of optional entries where the index is meaningful
#[derive(Debug, Clone)]
pub struct Slots<T> {
    entries: Vec<Option<T>>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` at `index`, growing and leaving any gap vacant.
    /// Returns the entry previously stored there.
    pub fn set(&mut self, index: usize, value: T) -> Option<T> {
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        self.entries[index].replace(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index).and_then(Option::as_mut)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Index extent (highest index + 1), including vacant slots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Number of occupied slots
    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Occupied entries with their index, in index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.as_mut().map(|v| (i, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_grows_with_gaps() {
        let mut slots = Slots::new();
        assert!(slots.is_empty());
        assert_eq!(slots.set(4, "four"), None);
        assert_eq!(slots.len(), 5);
        assert_eq!(slots.occupied(), 1);
        assert!(!slots.contains(2));
        assert_eq!(slots.get(4), Some(&"four"));
        assert_eq!(slots.get(9), None);

        slots.set(1, "one");
        assert_eq!(slots.len(), 5);
        let ids: Vec<usize> = slots.iter().map(|(i, _)| i).collect();
        assert_eq!(ids, vec![1, 4]);
    }

    #[test]
    fn test_set_replaces() {
        let mut slots = Slots::new();
        slots.set(0, 1);
        assert_eq!(slots.set(0, 2), Some(1));
        if let Some(v) = slots.get_mut(0) {
            *v += 1;
        }
        assert_eq!(slots.get(0), Some(&3));
    }
}
