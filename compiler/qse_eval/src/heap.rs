// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::val::{ArrayId, Pointer, ResultId, SlotId, StringId, TupleId, Value};
use crate::Error;
use rustc_hash::{FxHashMap, FxHashSet};

/// The lifecycle state of a measurement outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultState {
    /// Not yet projected from a distribution. `position` is the classical
    /// bit position assigned when the qubit was measured into the current
    /// builder, if it has been.
    Pending { position: Option<usize> },
    Zero,
    One,
}

#[derive(Clone, Debug)]
struct Entry<T> {
    data: T,
    refcount: i64,
    alias_count: i64,
}

impl<T> Entry<T> {
    fn new(data: T) -> Self {
        Self {
            data,
            refcount: 1,
            alias_count: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArrayData {
    pub elements: Vec<Value>,
    pub elem_size: u64,
}

/// The set of currently-live qubit ids. Ids are never reused within one
/// execution; the high-water mark feeds backend feature negotiation.
#[derive(Debug, Default)]
pub struct QubitPool {
    live: FxHashSet<usize>,
    /// Ids handed out by `allocate`, as opposed to static literals.
    allocated: FxHashSet<usize>,
    next_id: usize,
    high_water: usize,
    capacity: Option<u64>,
    allocations: u64,
    releases: u64,
}

impl QubitPool {
    pub fn set_capacity(&mut self, capacity: Option<u64>) {
        self.capacity = capacity;
    }

    pub fn allocate(&mut self) -> Result<usize, Error> {
        let id = self.next_id;
        if let Some(capacity) = self.capacity {
            if self.live.len() as u64 >= capacity {
                return Err(Error::OutOfQubits);
            }
        }
        self.next_id += 1;
        self.live.insert(id);
        self.allocated.insert(id);
        self.high_water = self.high_water.max(id + 1);
        self.allocations += 1;
        Ok(id)
    }

    /// Registers a statically-encoded qubit literal (`inttoptr`/`null`) as
    /// live.
    pub fn touch_literal(&mut self, id: usize) {
        if self.live.insert(id) {
            self.next_id = self.next_id.max(id + 1);
            self.high_water = self.high_water.max(id + 1);
        }
    }

    pub fn release(&mut self, id: usize) -> Result<(), Error> {
        if self.live.remove(&id) {
            self.releases += 1;
            Ok(())
        } else {
            Err(Error::QubitUseAfterRelease(id))
        }
    }

    pub fn assert_live(&self, id: usize) -> Result<(), Error> {
        if self.live.contains(&id) {
            Ok(())
        } else {
            Err(Error::QubitUseAfterRelease(id))
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Live qubits that were handed out by `allocate` and never released.
    /// Static literals are excluded; nothing ever releases those.
    #[must_use]
    pub fn leaked(&self) -> Vec<usize> {
        let mut leaked: Vec<usize> = self
            .live
            .iter()
            .filter(|id| self.allocated.contains(*id))
            .copied()
            .collect();
        leaked.sort_unstable();
        leaked
    }

    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Total allocations and releases, used to gate projection-cache
    /// recording.
    #[must_use]
    pub fn churn(&self) -> u64 {
        self.allocations + self.releases
    }
}

/// The four heap tables plus `alloca` slots.
///
/// Refcount gates lifetime: an entry is freed exactly when its refcount
/// reaches zero. Alias count gates mutation: a write to an entry with a
/// positive alias count copies the storage first.
#[derive(Debug, Default)]
pub struct Heap {
    arrays: FxHashMap<usize, Entry<ArrayData>>,
    tuples: FxHashMap<usize, Entry<Vec<Value>>>,
    results: FxHashMap<usize, Entry<ResultState>>,
    strings: FxHashMap<usize, Entry<Vec<u8>>>,
    slots: FxHashMap<usize, Value>,
    next_array: usize,
    next_tuple: usize,
    next_result: usize,
    next_string: usize,
    next_slot: usize,
    allocations: u64,
}

impl Heap {
    fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Error {
        Error::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Total heap allocations, used to gate projection-cache recording.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    // Arrays

    pub fn alloc_array(&mut self, elem_size: u64, length: usize) -> ArrayId {
        let id = self.next_array;
        self.next_array += 1;
        self.allocations += 1;
        self.arrays.insert(
            id,
            Entry::new(ArrayData {
                elements: vec![Value::Null; length],
                elem_size,
            }),
        );
        ArrayId(id)
    }

    pub fn array(&self, id: ArrayId) -> Result<&ArrayData, Error> {
        self.arrays
            .get(&id.0)
            .map(|e| &e.data)
            .ok_or_else(|| Error::UndefinedSymbol(format!("array {}", id.0)))
    }

    pub fn array_get(&self, id: ArrayId, index: usize) -> Result<Value, Error> {
        let data = self.array(id)?;
        data.elements.get(index).cloned().ok_or_else(|| {
            Self::type_mismatch(
                format!("index below array length {}", data.elements.len()),
                format!("index {index}"),
            )
        })
    }

    pub fn array_set(&mut self, id: ArrayId, index: usize, value: Value) -> Result<(), Error> {
        let aliased = self
            .arrays
            .get(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("array {}", id.0)))?
            .alias_count
            > 0;
        if aliased {
            // Copy-on-write: the storage is deep-copied and reinstalled
            // under the same id; QIR cannot observe entry identity apart
            // from the handle.
            let shared = self.array(id)?.elements.clone();
            let mut copied = Vec::with_capacity(shared.len());
            for element in &shared {
                copied.push(self.deep_copy(element)?);
            }
            let entry = self
                .arrays
                .get_mut(&id.0)
                .ok_or_else(|| Error::UndefinedSymbol(format!("array {}", id.0)))?;
            entry.data.elements = copied;
            entry.alias_count = 0;
            log::trace!("copy-on-write on aliased array {}", id.0);
        }
        let entry = self
            .arrays
            .get_mut(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("array {}", id.0)))?;
        let len = entry.data.elements.len();
        match entry.data.elements.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Self::type_mismatch(
                format!("index below array length {len}"),
                format!("index {index}"),
            )),
        }
    }

    /// Duplicates a value's heap contents into fresh entries, recursively.
    /// Scalars and handles to unmanaged locations pass through unchanged.
    pub fn deep_copy(&mut self, value: &Value) -> Result<Value, Error> {
        match value {
            Value::Array(id) => {
                let source = self.array(*id)?.clone();
                let mut elements = Vec::with_capacity(source.elements.len());
                for element in &source.elements {
                    elements.push(self.deep_copy(element)?);
                }
                let copy = self.alloc_array(source.elem_size, 0);
                self.arrays
                    .get_mut(&copy.0)
                    .expect("freshly allocated array should exist")
                    .data
                    .elements = elements;
                Ok(Value::Array(copy))
            }
            Value::Tuple(id) => {
                let source = self
                    .tuples
                    .get(&id.0)
                    .ok_or_else(|| Error::UndefinedSymbol(format!("tuple {}", id.0)))?
                    .data
                    .clone();
                let mut fields = Vec::with_capacity(source.len());
                for field in &source {
                    fields.push(self.deep_copy(field)?);
                }
                let copy = self.alloc_tuple();
                self.tuples
                    .get_mut(&copy.0)
                    .expect("freshly allocated tuple should exist")
                    .data = fields;
                Ok(Value::Tuple(copy))
            }
            Value::String(id) => {
                let bytes = self.string(*id)?.to_vec();
                Ok(Value::String(self.alloc_string(bytes)))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn array_concat(&mut self, a: ArrayId, b: ArrayId) -> Result<ArrayId, Error> {
        let left = self.array(a)?.clone();
        let right = self.array(b)?;
        let mut elements = left.elements;
        elements.extend(right.elements.iter().cloned());
        let id = self.alloc_array(left.elem_size, 0);
        self.arrays
            .get_mut(&id.0)
            .expect("freshly allocated array should exist")
            .data
            .elements = elements;
        Ok(id)
    }

    // Tuples

    pub fn alloc_tuple(&mut self) -> TupleId {
        let id = self.next_tuple;
        self.next_tuple += 1;
        self.allocations += 1;
        self.tuples.insert(id, Entry::new(Vec::new()));
        TupleId(id)
    }

    pub fn tuple_get(&self, id: TupleId, index: usize) -> Result<Value, Error> {
        let entry = self
            .tuples
            .get(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("tuple {}", id.0)))?;
        Ok(entry.data.get(index).cloned().unwrap_or(Value::Null))
    }

    pub fn tuple_set(&mut self, id: TupleId, index: usize, value: Value) -> Result<(), Error> {
        let aliased = self
            .tuples
            .get(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("tuple {}", id.0)))?
            .alias_count
            > 0;
        if aliased {
            let shared = self
                .tuples
                .get(&id.0)
                .expect("aliased tuple should still exist")
                .data
                .clone();
            let mut copied = Vec::with_capacity(shared.len());
            for field in &shared {
                copied.push(self.deep_copy(field)?);
            }
            let entry = self
                .tuples
                .get_mut(&id.0)
                .ok_or_else(|| Error::UndefinedSymbol(format!("tuple {}", id.0)))?;
            entry.data = copied;
            entry.alias_count = 0;
            log::trace!("copy-on-write on aliased tuple {}", id.0);
        }
        let entry = self
            .tuples
            .get_mut(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("tuple {}", id.0)))?;
        // Tuple field counts come from typed stores, so the storage grows on
        // demand.
        if entry.data.len() <= index {
            entry.data.resize(index + 1, Value::Null);
        }
        entry.data[index] = value;
        Ok(())
    }

    // Results

    pub fn alloc_result(&mut self, state: ResultState) -> ResultId {
        let id = self.next_result;
        self.next_result += 1;
        self.allocations += 1;
        self.results.insert(id, Entry::new(state));
        ResultId(id)
    }

    /// Registers a statically-encoded result literal, creating its entry on
    /// first use.
    pub fn ensure_static_result(&mut self, id: usize) -> ResultId {
        if !self.results.contains_key(&id) {
            self.next_result = self.next_result.max(id + 1);
            self.allocations += 1;
            self.results
                .insert(id, Entry::new(ResultState::Pending { position: None }));
        }
        ResultId(id)
    }

    pub fn result_state(&self, id: ResultId) -> Result<ResultState, Error> {
        self.results
            .get(&id.0)
            .map(|e| e.data)
            .ok_or_else(|| Error::UndefinedSymbol(format!("result {}", id.0)))
    }

    pub fn set_result_state(&mut self, id: ResultId, state: ResultState) -> Result<(), Error> {
        let entry = self
            .results
            .get_mut(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("result {}", id.0)))?;
        entry.data = state;
        Ok(())
    }

    /// Pending results that hold a classical bit position in the current
    /// builder.
    #[must_use]
    pub fn pending_positioned_results(&self) -> Vec<(ResultId, usize)> {
        let mut pending: Vec<_> = self
            .results
            .iter()
            .filter_map(|(id, e)| match e.data {
                ResultState::Pending {
                    position: Some(position),
                } => Some((ResultId(*id), position)),
                _ => None,
            })
            .collect();
        pending.sort_unstable_by_key(|(_, position)| *position);
        pending
    }

    // Strings

    pub fn alloc_string(&mut self, bytes: Vec<u8>) -> StringId {
        let id = self.next_string;
        self.next_string += 1;
        self.allocations += 1;
        self.strings.insert(id, Entry::new(bytes));
        StringId(id)
    }

    pub fn string(&self, id: StringId) -> Result<&[u8], Error> {
        self.strings
            .get(&id.0)
            .map(|e| e.data.as_slice())
            .ok_or_else(|| Error::UndefinedSymbol(format!("string {}", id.0)))
    }

    // Alloca slots

    pub fn alloc_slot(&mut self) -> SlotId {
        let id = self.next_slot;
        self.next_slot += 1;
        self.allocations += 1;
        self.slots.insert(id, Value::Null);
        SlotId(id)
    }

    pub fn slot_get(&self, id: SlotId) -> Result<Value, Error> {
        self.slots
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::UndefinedSymbol(format!("slot {}", id.0)))
    }

    pub fn slot_set(&mut self, id: SlotId, value: Value) -> Result<(), Error> {
        let slot = self
            .slots
            .get_mut(&id.0)
            .ok_or_else(|| Error::UndefinedSymbol(format!("slot {}", id.0)))?;
        *slot = value;
        Ok(())
    }

    // Pointer plumbing shared by load/store.

    pub fn read_pointer(&self, pointer: Pointer) -> Result<Value, Error> {
        match pointer {
            Pointer::Slot(slot) => self.slot_get(slot),
            Pointer::ArrayElement(array, index) => self.array_get(array, index),
            Pointer::TupleElement(tuple, index) => self.tuple_get(tuple, index),
        }
    }

    pub fn write_pointer(&mut self, pointer: Pointer, value: Value) -> Result<(), Error> {
        match pointer {
            Pointer::Slot(slot) => self.slot_set(slot, value),
            Pointer::ArrayElement(array, index) => self.array_set(array, index, value),
            Pointer::TupleElement(tuple, index) => self.tuple_set(tuple, index, value),
        }
    }

    // Refcount discipline. An entry is freed exactly when its refcount
    // reaches zero; decrements below zero on a live handle warn and clamp.

    pub fn update_array_refcount(&mut self, id: ArrayId, delta: i64) -> Result<(), Error> {
        update_refcount(&mut self.arrays, id.0, delta, "array")
    }

    pub fn update_tuple_refcount(&mut self, id: TupleId, delta: i64) -> Result<(), Error> {
        update_refcount(&mut self.tuples, id.0, delta, "tuple")
    }

    pub fn update_result_refcount(&mut self, id: ResultId, delta: i64) -> Result<(), Error> {
        update_refcount(&mut self.results, id.0, delta, "result")
    }

    pub fn update_string_refcount(&mut self, id: StringId, delta: i64) -> Result<(), Error> {
        update_refcount(&mut self.strings, id.0, delta, "string")
    }

    pub fn update_array_alias(&mut self, id: ArrayId, delta: i64) -> Result<(), Error> {
        update_alias(&mut self.arrays, id.0, delta, "array")
    }

    pub fn update_tuple_alias(&mut self, id: TupleId, delta: i64) -> Result<(), Error> {
        update_alias(&mut self.tuples, id.0, delta, "tuple")
    }

    /// Heap entries still holding a positive refcount, for leak reporting.
    /// Results are outcome records rather than memory and are not reported.
    #[must_use]
    pub fn live_entries(&self) -> Vec<LiveEntry> {
        let mut live = Vec::new();
        for (id, e) in &self.arrays {
            live.push(LiveEntry {
                kind: "array",
                id: *id,
                refcount: e.refcount,
            });
        }
        for (id, e) in &self.tuples {
            live.push(LiveEntry {
                kind: "tuple",
                id: *id,
                refcount: e.refcount,
            });
        }
        for (id, e) in &self.strings {
            live.push(LiveEntry {
                kind: "string",
                id: *id,
                refcount: e.refcount,
            });
        }
        live.sort_by_key(|e| (e.kind, e.id));
        live
    }
}

/// A heap entry that outlived the run.
#[derive(Clone, Debug)]
pub struct LiveEntry {
    pub kind: &'static str,
    pub id: usize,
    pub refcount: i64,
}

fn update_refcount<T>(
    table: &mut FxHashMap<usize, Entry<T>>,
    id: usize,
    delta: i64,
    kind: &str,
) -> Result<(), Error> {
    let Some(entry) = table.get_mut(&id) else {
        return Err(Error::RefcountUnderflow(format!(
            "{kind} {id} was already freed"
        )));
    };
    let updated = entry.refcount + delta;
    if updated < 0 {
        log::warn!("refcount update on {kind} {id} would drop below zero; clamping");
        entry.refcount = 0;
    } else {
        entry.refcount = updated;
    }
    if entry.refcount == 0 {
        table.remove(&id);
    }
    Ok(())
}

fn update_alias<T>(
    table: &mut FxHashMap<usize, Entry<T>>,
    id: usize,
    delta: i64,
    kind: &str,
) -> Result<(), Error> {
    let Some(entry) = table.get_mut(&id) else {
        return Err(Error::RefcountUnderflow(format!(
            "{kind} {id} was already freed"
        )));
    };
    entry.alias_count = (entry.alias_count + delta).max(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Heap, QubitPool, ResultState};
    use crate::val::Value;

    #[test]
    fn refcount_zero_frees_the_entry() {
        let mut heap = Heap::default();
        let array = heap.alloc_array(8, 2);
        heap.update_array_refcount(array, 1).expect("update should succeed");
        heap.update_array_refcount(array, -2).expect("update should succeed");
        assert!(heap.array(array).is_err());
    }

    #[test]
    fn aliased_write_deep_copies_nested_entries() {
        let mut heap = Heap::default();
        let inner = heap.alloc_array(8, 1);
        let outer = heap.alloc_array(8, 1);
        heap.array_set(outer, 0, Value::Array(inner))
            .expect("write should succeed");
        heap.update_array_alias(outer, 1).expect("update should succeed");

        heap.array_set(outer, 0, Value::Int { width: 64, value: 7 })
            .expect("aliased write should copy first");
        assert_eq!(
            heap.array_get(outer, 0).expect("read should succeed"),
            Value::Int { width: 64, value: 7 }
        );
        // The original inner entry is untouched by the copy.
        assert_eq!(heap.array(inner).expect("inner should live").elements.len(), 1);
    }

    #[test]
    fn static_results_do_not_collide_with_fresh_ids() {
        let mut heap = Heap::default();
        let static_result = heap.ensure_static_result(5);
        let fresh = heap.alloc_result(ResultState::Zero);
        assert_eq!(static_result.0, 5);
        assert_eq!(fresh.0, 6);
    }

    #[test]
    fn literal_qubits_are_not_reported_as_leaks() {
        let mut pool = QubitPool::default();
        pool.touch_literal(0);
        pool.touch_literal(1);
        let allocated = pool.allocate().expect("allocation should succeed");
        assert_eq!(allocated, 2);
        assert_eq!(pool.leaked(), vec![2]);
        pool.release(allocated).expect("release should succeed");
        assert!(pool.leaked().is_empty());
    }
}
