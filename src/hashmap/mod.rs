//! Ordered hashmap backing every array and object value.
//!
//! Entries live in an index arena. Each node sits on two doubly linked lists:
//! the insertion-order list (head/tail) and the collision chain of its bucket.
//! Node ids are stable across rehashing, so a cursor parked on a node stays
//! valid while the table grows.

use std::fmt;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::value::Value;

const INITIAL_BUCKETS: usize = 16;
const FILL_FACTOR: usize = 3;

pub type NodeId = u32;

// ── Keys ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(Rc<str>),
}

impl Key {
    /// Builds a key from user text, converting only canonical decimal
    /// integers (`0`, `42`, `-7`) to integer keys. `"01"`, `"+1"`, `"-0"`
    /// and `" 1"` stay string keys.
    pub fn from_text(text: &str) -> Key {
        match canonical_int(text) {
            Some(n) => Key::Int(n),
            None => Key::Str(Rc::from(text)),
        }
    }

    /// Key used when `value` appears inside `[]` or on the left of `=>`.
    pub fn from_value(value: &Value) -> Key {
        use crate::value::Repr;
        match value.repr() {
            Repr::Int(n) => Key::Int(*n),
            Repr::Bool(b) => Key::Int(*b as i64),
            Repr::Real(_) | Repr::Resource(_) => Key::Int(value.to_int()),
            Repr::Str(s) => Key::from_text(s),
            Repr::Null => Key::Str(Rc::from("")),
            Repr::Array(_) => Key::Str(value.to_str()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(n) => Value::from(*n),
            Key::Str(s) => Value::from(Rc::clone(s)),
        }
    }

    fn hash(&self) -> u32 {
        match self {
            Key::Int(k) => int_hash(*k),
            Key::Str(s) => str_hash(s.as_bytes()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::from_text(s)
    }
}

/// Returns the integer for text in canonical decimal form: `0` or an
/// optional `-` followed by a non-zero digit and more digits, within `i64`.
pub fn canonical_int(text: &str) -> Option<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let bytes = digits.as_bytes();
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes[0] == b'0' && (bytes.len() > 1 || digits.len() != text.len()) {
        return None;
    }
    text.parse::<i64>().ok()
}

fn int_hash(k: i64) -> u32 {
    (k ^ (k << 8) ^ (k >> 8)) as u32
}

fn str_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(5381u32, |h, &b| h.wrapping_mul(33).wrapping_add(b as u32))
}

// ── Nodes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Node {
    key: Key,
    hash: u32,
    value: Value,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    chain_prev: Option<NodeId>,
    chain_next: Option<NodeId>,
}

// ── Hashmap ──────────────────────────────────────────────────────────

/// Insertion-ordered associative container. Sharing is by `Rc<Hashmap>`;
/// the strong count is the map's reference count and `Rc::make_mut` is the
/// copy-on-write point.
#[derive(Debug, Clone)]
pub struct Hashmap {
    buckets: Vec<Option<NodeId>>,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    cursor: Option<NodeId>,
    len: usize,
    next_index: i64,
    index_exhausted: bool,
}

impl Default for Hashmap {
    fn default() -> Self {
        Hashmap::new()
    }
}

impl Hashmap {
    pub fn new() -> Self {
        Hashmap {
            buckets: vec![None; INITIAL_BUCKETS],
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            cursor: None,
            len: 0,
            next_index: 0,
            index_exhausted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// The integer key the next auto-indexed insert will receive.
    pub fn next_auto_index(&self) -> i64 {
        self.next_index
    }

    fn node(&self, id: NodeId) -> &Node {
        match &self.nodes[id as usize] {
            Some(node) => node,
            None => unreachable!("dangling hashmap node {id}"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match &mut self.nodes[id as usize] {
            Some(node) => node,
            None => unreachable!("dangling hashmap node {id}"),
        }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn find(&self, key: &Key) -> Option<NodeId> {
        let hash = key.hash();
        let mut at = self.buckets[self.bucket_of(hash)];
        while let Some(id) = at {
            let node = self.node(id);
            if node.hash == hash && node.key == *key {
                return Some(id);
            }
            at = node.chain_next;
        }
        None
    }

    /// Finds the entry for `key`.
    pub fn lookup(&self, key: &Key) -> Option<(&Key, &Value)> {
        self.find(key).map(|id| {
            let node = self.node(id);
            (&node.key, &node.value)
        })
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.find(key).map(|id| &self.node(id).value)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Value> {
        let id = self.find(key)?;
        Some(&mut self.node_mut(id).value)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.find(key).is_some()
    }

    /// Inserts or overwrites. An overwritten entry keeps its position and the
    /// previous value is returned.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        if let Some(id) = self.find(&key) {
            return Some(std::mem::replace(&mut self.node_mut(id).value, value));
        }
        if let Key::Int(n) = key {
            self.bump_index(n);
        }
        self.link_new(key, value);
        None
    }

    /// Appends under the next auto index. Returns `None` once the integer
    /// key space is exhausted; the map is left unchanged in that case.
    pub fn push(&mut self, value: Value) -> Option<i64> {
        if self.index_exhausted {
            return None;
        }
        let n = self.next_index;
        self.insert(Key::Int(n), value);
        Some(n)
    }

    /// Returns the value for `key`, inserting `make()` first when absent.
    pub fn entry_or_insert_with(&mut self, key: Key, make: impl FnOnce() -> Value) -> &mut Value {
        let id = match self.find(&key) {
            Some(id) => id,
            None => {
                if let Key::Int(n) = key {
                    self.bump_index(n);
                }
                self.link_new(key, make())
            }
        };
        &mut self.node_mut(id).value
    }

    /// Appends a new auto-indexed entry and returns a handle to its value.
    pub fn push_slot(&mut self, value: Value) -> Option<&mut Value> {
        let n = self.push(value)?;
        self.get_mut(&Key::Int(n))
    }

    fn bump_index(&mut self, n: i64) {
        if n >= self.next_index {
            match n.checked_add(1) {
                Some(next) => self.next_index = next,
                None => self.index_exhausted = true,
            }
        }
    }

    fn link_new(&mut self, key: Key, value: Value) -> NodeId {
        if self.len >= self.buckets.len() * FILL_FACTOR {
            self.grow();
        }
        let hash = key.hash();
        let node = Node {
            key,
            hash,
            value,
            prev: self.tail,
            next: None,
            chain_prev: None,
            chain_next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as NodeId
            }
        };
        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        if self.cursor.is_none() {
            self.cursor = Some(id);
        }
        self.chain_in(id);
        self.len += 1;
        id
    }

    fn chain_in(&mut self, id: NodeId) {
        let bucket = self.bucket_of(self.node(id).hash);
        let old = self.buckets[bucket];
        {
            let node = self.node_mut(id);
            node.chain_prev = None;
            node.chain_next = old;
        }
        if let Some(old) = old {
            self.node_mut(old).chain_prev = Some(id);
        }
        self.buckets[bucket] = Some(id);
    }

    fn grow(&mut self) {
        let size = self.buckets.len() * 2;
        self.buckets = vec![None; size];
        let mut at = self.head;
        while let Some(id) = at {
            self.chain_in(id);
            at = self.node(id).next;
        }
    }

    /// Removes `key`. The cursor moves to the following entry when it was
    /// parked on the removed one. The auto index is never rolled back.
    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let id = self.find(key)?;
        let node = self.nodes[id as usize].take()?;

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        match node.chain_prev {
            Some(prev) => self.node_mut(prev).chain_next = node.chain_next,
            None => {
                let bucket = self.bucket_of(node.hash);
                self.buckets[bucket] = node.chain_next;
            }
        }
        if let Some(next) = node.chain_next {
            self.node_mut(next).chain_prev = node.chain_prev;
        }
        if self.cursor == Some(id) {
            self.cursor = node.next;
        }
        self.free.push(id);
        self.len -= 1;
        Some(node.value)
    }

    /// Visits entries in insertion order until `visit` breaks. Returns
    /// `false` when the walk was cut short.
    pub fn walk<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&Key, &Value) -> ControlFlow<()>,
    {
        let mut at = self.head;
        while let Some(id) = at {
            let node = self.node(id);
            if visit(&node.key, &node.value).is_break() {
                return false;
            }
            at = node.next;
        }
        true
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter { map: self, at: self.head, remaining: self.len }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> + '_ {
        self.iter().map(|(_, v)| v)
    }

    pub fn first(&self) -> Option<(&Key, &Value)> {
        self.head.map(|id| self.entry(id))
    }

    pub fn last(&self) -> Option<(&Key, &Value)> {
        self.tail.map(|id| self.entry(id))
    }

    // ---- node-level traversal (foreach snapshots) ----

    pub fn first_node(&self) -> Option<NodeId> {
        self.head
    }

    pub fn next_node(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id as usize)?.as_ref()?.next
    }

    pub fn entry(&self, id: NodeId) -> (&Key, &Value) {
        let node = self.node(id);
        (&node.key, &node.value)
    }

    // ---- internal cursor ----

    pub fn reset_cursor(&mut self) {
        self.cursor = self.head;
    }

    pub fn current(&self) -> Option<(&Key, &Value)> {
        self.cursor.map(|id| self.entry(id))
    }

    pub fn advance_cursor(&mut self) -> Option<(&Key, &Value)> {
        let id = self.cursor?;
        self.cursor = self.node(id).next;
        self.current()
    }

    /// Adds every entry of `other` whose key is missing here.
    pub fn union_with(&mut self, other: &Hashmap) {
        for (key, value) in other.iter() {
            if !self.contains_key(key) {
                self.insert(key.clone(), value.clone());
            }
        }
    }

    /// True when the keys are exactly `0..len` in insertion order.
    pub fn is_list(&self) -> bool {
        self.keys()
            .enumerate()
            .all(|(i, k)| matches!(k, Key::Int(n) if *n == i as i64))
    }
}

impl FromIterator<Value> for Hashmap {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut map = Hashmap::new();
        for value in iter {
            map.push(value);
        }
        map
    }
}

impl FromIterator<(Key, Value)> for Hashmap {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut map = Hashmap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

pub struct Iter<'a> {
    map: &'a Hashmap,
    at: Option<NodeId>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a Key, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.at?;
        let node = self.map.node(id);
        self.at = node.next;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a Hashmap {
    type Item = (&'a Key, &'a Value);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of(map: &Hashmap) -> Vec<String> {
        map.keys().map(|k| k.to_string()).collect()
    }

    #[test]
    fn canonical_integer_keys() {
        assert_eq!(Key::from_text("0"), Key::Int(0));
        assert_eq!(Key::from_text("42"), Key::Int(42));
        assert_eq!(Key::from_text("-7"), Key::Int(-7));
        assert_eq!(Key::from_text("9223372036854775807"), Key::Int(i64::MAX));
        assert_eq!(Key::from_text("-9223372036854775808"), Key::Int(i64::MIN));
        for text in ["01", "+1", "-0", " 1", "1 ", "1.0", "1e3", "", "-", "9223372036854775808", "0x1"] {
            assert!(matches!(Key::from_text(text), Key::Str(_)), "{text:?} should stay a string key");
        }
    }

    #[test]
    fn canonical_string_and_int_share_an_entry() {
        let mut map = Hashmap::new();
        map.insert(Key::from_text("5"), Value::from("a"));
        map.insert(Key::Int(5), Value::from("b"));
        assert_eq!(map.len(), 1);
        map.insert(Key::from_text("05"), Value::from("c"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&Key::Int(5)), Some(&Value::from("b")));
    }

    #[test]
    fn insertion_order_survives_removal_and_reinsert() {
        let mut map = Hashmap::new();
        for k in ["a", "b", "c", "d"] {
            map.insert(Key::from(k), Value::null());
        }
        map.remove(&Key::from("b"));
        map.insert(Key::from("b"), Value::null());
        map.insert(Key::from("a"), Value::from(1));
        assert_eq!(keys_of(&map), ["a", "c", "d", "b"]);
    }

    #[test]
    fn order_preserved_across_growth() {
        let mut map = Hashmap::new();
        for i in 0..500i64 {
            map.insert(Key::Int(i * 7 - 1000), Value::from(i));
        }
        assert!(map.bucket_count() > INITIAL_BUCKETS);
        let values: Vec<i64> = map.values().map(|v| v.to_int()).collect();
        assert_eq!(values, (0..500).collect::<Vec<_>>());
        for i in 0..500i64 {
            assert_eq!(map.get(&Key::Int(i * 7 - 1000)), Some(&Value::from(i)));
        }
    }

    #[test]
    fn auto_index_is_monotonic() {
        let mut map = Hashmap::new();
        assert_eq!(map.push(Value::from(1)), Some(0));
        assert_eq!(map.push(Value::from(2)), Some(1));
        map.remove(&Key::Int(1));
        assert_eq!(map.next_auto_index(), 2);
        assert_eq!(map.push(Value::from(3)), Some(2));
        map.insert(Key::Int(10), Value::null());
        assert_eq!(map.push(Value::null()), Some(11));
        map.insert(Key::Int(-5), Value::null());
        assert_eq!(map.next_auto_index(), 12);
    }

    #[test]
    fn auto_index_exhaustion() {
        let mut map = Hashmap::new();
        map.insert(Key::Int(i64::MAX), Value::null());
        assert_eq!(map.push(Value::null()), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_missing_key_is_none() {
        let mut map: Hashmap = [Value::from(1)].into_iter().collect();
        assert!(map.remove(&Key::Int(3)).is_none());
        assert_eq!(map.remove(&Key::Int(0)), Some(Value::from(1)));
        assert!(map.is_empty());
        assert!(map.first().is_none());
    }

    #[test]
    fn walk_stops_on_break_and_restarts() {
        let map: Hashmap = (1..=5).map(Value::from).collect();
        let mut seen = Vec::new();
        let finished = map.walk(|_, v| {
            seen.push(v.to_int());
            if v.to_int() == 3 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
        });
        assert!(!finished);
        assert_eq!(seen, [1, 2, 3]);
        let mut count = 0;
        assert!(map.walk(|_, _| {
            count += 1;
            ControlFlow::Continue(())
        }));
        assert_eq!(count, 5);
    }

    #[test]
    fn cursor_skips_removed_entry() {
        let mut map: Hashmap = (0..3).map(Value::from).collect();
        map.reset_cursor();
        map.advance_cursor();
        assert_eq!(map.current().map(|(k, _)| k.clone()), Some(Key::Int(1)));
        map.remove(&Key::Int(1));
        assert_eq!(map.current().map(|(k, _)| k.clone()), Some(Key::Int(2)));
    }

    #[test]
    fn union_keeps_left_values() {
        let mut left: Hashmap = [Value::from("a"), Value::from("b")].into_iter().collect();
        let right: Hashmap = [Value::from("x"), Value::from("y"), Value::from("z")].into_iter().collect();
        left.union_with(&right);
        let values: Vec<String> = left.values().map(|v| v.to_str().to_string()).collect();
        assert_eq!(values, ["a", "b", "z"]);
    }

    #[test]
    fn colliding_keys_chain() {
        let mut map = Hashmap::new();
        // low hash bits are zero for these keys, so they all land in bucket 0
        for i in 0..40i64 {
            map.insert(Key::Int(i << 20), Value::from(i));
        }
        for i in (0..40i64).step_by(3) {
            map.remove(&Key::Int(i << 20));
        }
        for i in 0..40i64 {
            let expect = if i % 3 == 0 { None } else { Some(Value::from(i)) };
            assert_eq!(map.get(&Key::Int(i << 20)).cloned(), expect);
        }
    }

    #[test]
    fn is_list_detects_sequential_keys() {
        let mut map: Hashmap = (0..3).map(Value::from).collect();
        assert!(map.is_list());
        map.insert(Key::from("k"), Value::null());
        assert!(!map.is_list());
    }
}
