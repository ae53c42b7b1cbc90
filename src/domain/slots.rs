//! Slot data model
//!
//! A smart box holds a fixed row of storage cells. Each cell is reported by
//! the device as a [`Slot`]; a full notification becomes a [`SlotTable`].

/// One storage cell of the smart box
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Slot {
    pub id: String,
    pub brand: String,
    pub model: String,
    pub color: String,
    pub year: String,
    pub is_empty: bool,
}

impl Slot {
    /// An empty cell. All descriptive fields stay blank.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_empty: true,
            ..Default::default()
        }
    }

    pub fn occupied(
        id: impl Into<String>,
        brand: impl Into<String>,
        model: impl Into<String>,
        color: impl Into<String>,
        year: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            brand: brand.into(),
            model: model.into(),
            color: color.into(),
            year: year.into(),
            is_empty: false,
        }
    }

    /// "<brand> <model>", the text used for search
    pub fn display_title(&self) -> String {
        format!("{} {}", self.brand, self.model)
    }

    fn matches(&self, needle: &str) -> bool {
        self.is_empty || self.display_title().to_lowercase().contains(needle)
    }
}

/// Ordered snapshot of all slots from one notification
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a slot. Returns false (and keeps the table unchanged) when the id
    /// is already present.
    pub fn push(&mut self, slot: Slot) -> bool {
        if self.contains(&slot.id) {
            return false;
        }
        self.slots.push(slot);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.iter().any(|s| s.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty).count()
    }

    /// Case-insensitive match on "<brand> <model>". Empty cells always match so
    /// free space stays visible while filtering.
    pub fn search(&self, query: &str) -> Vec<&Slot> {
        let needle = query.trim().to_lowercase();
        self.slots.iter().filter(|s| s.matches(&needle)).collect()
    }
}

impl<'a> IntoIterator for &'a SlotTable {
    type Item = &'a Slot;
    type IntoIter = std::slice::Iter<'a, Slot>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}
