use syncline_core::models::{PendingOperation, PendingState, RawEvent};

/// Optimistic writes awaiting confirmation from the authoritative path.
#[derive(Debug, Default)]
pub struct PendingLedger {
    operations: Vec<PendingOperation>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by `local_id`.
    pub fn record(&mut self, operation: PendingOperation) {
        match self
            .operations
            .iter_mut()
            .find(|existing| existing.local_id == operation.local_id)
        {
            Some(existing) => *existing = operation,
            None => self.operations.push(operation),
        }
    }

    pub fn get(&self, local_id: &str) -> Option<&PendingOperation> {
        self.operations.iter().find(|op| op.local_id == local_id)
    }

    /// Pair an incoming event with the write it confirms: by echoed local id
    /// first, then by match key.
    pub fn find_for(&self, event: &RawEvent) -> Option<&PendingOperation> {
        if let Some(local_id) = event.local_id.as_deref() {
            if let Some(op) = self.get(local_id) {
                return Some(op);
            }
        }
        let key = event.effective_match_key()?;
        self.operations.iter().find(|op| op.match_key == key)
    }

    pub fn set_state(&mut self, local_id: &str, state: PendingState) -> bool {
        match self.operations.iter_mut().find(|op| op.local_id == local_id) {
            Some(op) => {
                op.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, local_id: &str) -> Option<PendingOperation> {
        let index = self.operations.iter().position(|op| op.local_id == local_id)?;
        Some(self.operations.remove(index))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.operations.iter()
    }
}
