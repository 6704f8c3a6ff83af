//! The VM value table: reference-counted variable slots.
//!
//! Every variable binding points at a slot. `=&`, `uplink` and `static`
//! bind further names to the same slot and bump its count; a slot is
//! released back to the free list when its last binding goes away.

use crate::value::Value;

pub type SlotId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value table exhausted at {limit} values")]
pub struct TableFull {
    pub limit: usize,
}

#[derive(Debug, Default)]
pub struct SlotTable {
    values: Vec<Value>,
    refs: Vec<u32>,
    free: Vec<SlotId>,
    live: usize,
    limit: Option<usize>,
}

impl SlotTable {
    pub fn new(limit: Option<usize>) -> Self {
        SlotTable { limit, ..SlotTable::default() }
    }

    /// Number of slots currently bound.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Stores `value` in a fresh slot with one reference.
    pub fn alloc(&mut self, value: Value) -> Result<SlotId, TableFull> {
        if let Some(limit) = self.limit {
            if self.live >= limit {
                return Err(TableFull { limit });
            }
        }
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.values[id as usize] = value;
                self.refs[id as usize] = 1;
                Ok(id)
            }
            None => {
                self.values.push(value);
                self.refs.push(1);
                Ok((self.values.len() - 1) as SlotId)
            }
        }
    }

    pub fn retain(&mut self, id: SlotId) {
        if let Some(count) = self.refs.get_mut(id as usize) {
            *count += 1;
        }
    }

    /// Drops one reference; the value is released with the last one.
    pub fn release(&mut self, id: SlotId) {
        let Some(count) = self.refs.get_mut(id as usize) else {
            return;
        };
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.values[id as usize] = Value::null();
            self.free.push(id);
            self.live -= 1;
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&Value> {
        self.values.get(id as usize)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Value> {
        self.values.get_mut(id as usize)
    }

    pub fn ref_count(&self, id: SlotId) -> u32 {
        self.refs.get(id as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_frees_with_last_reference() {
        let mut table = SlotTable::new(None);
        let a = table.alloc(Value::from(1)).unwrap();
        table.retain(a);
        table.release(a);
        assert_eq!(table.get(a), Some(&Value::from(1)));
        table.release(a);
        assert_eq!(table.live(), 0);
        let b = table.alloc(Value::from("x")).unwrap();
        assert_eq!(a, b, "freed slot is reused");
        assert_eq!(table.ref_count(b), 1);
    }

    #[test]
    fn limit_is_enforced_on_live_slots() {
        let mut table = SlotTable::new(Some(2));
        let a = table.alloc(Value::null()).unwrap();
        table.alloc(Value::null()).unwrap();
        assert_eq!(table.alloc(Value::null()), Err(TableFull { limit: 2 }));
        table.release(a);
        assert!(table.alloc(Value::null()).is_ok());
    }

    #[test]
    fn extra_release_is_ignored() {
        let mut table = SlotTable::new(None);
        let a = table.alloc(Value::null()).unwrap();
        table.release(a);
        table.release(a);
        assert_eq!(table.live(), 0);
        assert_eq!(table.ref_count(a), 0);
    }
}
