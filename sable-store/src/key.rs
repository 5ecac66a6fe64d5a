//! Stored key representation with its per-key attribute bits.

use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Keys at or below this length live inline in the table slot and are excluded from per-object
/// heap accounting.
const INLINE_KEY_MAX: usize = 16;

const STICKY: u8 = 1 << 0;
const TOUCHED: u8 = 1 << 1;
const HAS_EXPIRE: u8 = 1 << 2;
const HAS_MCFLAG: u8 = 1 << 3;
const ASYNC_DELETE: u8 = 1 << 4;
const EXTERNAL: u8 = 1 << 5;
const COOL: u8 = 1 << 6;
const STASH_PENDING: u8 = 1 << 7;

/// A key as stored in the prime table: the byte string plus attribute bits.
///
/// The bits live in a `Cell` so read paths can mark hotness and observers can read attributes
/// through shared references. Equality and hashing consider only the bytes.
pub struct StoredKey {
    bytes: Box<[u8]>,
    flags: Cell<u8>,
}

impl StoredKey {
    /// Wraps key bytes with all attribute bits cleared.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
            flags: Cell::new(0),
        }
    }

    /// The key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the key takes the inline fast path for memory accounting.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.bytes.len() <= INLINE_KEY_MAX
    }

    /// Heap bytes attributed to this key; zero on the inline fast path.
    #[must_use]
    pub fn malloc_used(&self) -> usize {
        if self.is_inline() { 0 } else { self.bytes.len() }
    }

    fn get(&self, bit: u8) -> bool {
        self.flags.get() & bit != 0
    }

    fn put(&self, bit: u8, on: bool) {
        let flags = self.flags.get();
        self.flags.set(if on { flags | bit } else { flags & !bit });
    }

    /// Exempt from eviction.
    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.get(STICKY)
    }

    /// Marks or clears eviction exemption.
    pub fn set_sticky(&self, on: bool) {
        self.put(STICKY, on);
    }

    /// Recently read.
    #[must_use]
    pub fn is_touched(&self) -> bool {
        self.get(TOUCHED)
    }

    /// Marks or clears the hotness bit.
    pub fn set_touched(&self, on: bool) {
        self.put(TOUCHED, on);
    }

    /// Has an entry in the expire table.
    #[must_use]
    pub fn has_expire(&self) -> bool {
        self.get(HAS_EXPIRE)
    }

    /// Marks or clears deadline presence.
    pub fn set_has_expire(&self, on: bool) {
        self.put(HAS_EXPIRE, on);
    }

    /// Has an auxiliary 32-bit tag in the mcflag table.
    #[must_use]
    pub fn has_mcflag(&self) -> bool {
        self.get(HAS_MCFLAG)
    }

    /// Marks or clears auxiliary-tag presence.
    pub fn set_has_mcflag(&self, on: bool) {
        self.put(HAS_MCFLAG, on);
    }

    /// Value disposal may be deferred to idle time.
    #[must_use]
    pub fn is_async_delete(&self) -> bool {
        self.get(ASYNC_DELETE)
    }

    /// Marks or clears deferred-disposal eligibility.
    pub fn set_async_delete(&self, on: bool) {
        self.put(ASYNC_DELETE, on);
    }

    /// Value resides in tiered storage.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.get(EXTERNAL)
    }

    /// Marks or clears tiered residency.
    pub fn set_external(&self, on: bool) {
        self.put(EXTERNAL, on);
    }

    /// Tiered value still shadowed in memory.
    #[must_use]
    pub fn is_cool(&self) -> bool {
        self.get(COOL)
    }

    /// Marks or clears the in-memory shadow state.
    pub fn set_cool(&self, on: bool) {
        self.put(COOL, on);
    }

    /// An offload of this value is in flight.
    #[must_use]
    pub fn has_stash_pending(&self) -> bool {
        self.get(STASH_PENDING)
    }

    /// Marks or clears the in-flight offload state.
    pub fn set_stash_pending(&self, on: bool) {
        self.put(STASH_PENDING, on);
    }
}

impl fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKey")
            .field("bytes", &String::from_utf8_lossy(&self.bytes))
            .field("flags", &self.flags.get())
            .finish()
    }
}

impl PartialEq for StoredKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for StoredKey {}

impl Hash for StoredKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::StoredKey;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn flags_are_independent() {
        let key = StoredKey::new(b"k".to_vec());
        key.set_sticky(true);
        key.set_has_expire(true);
        assert_that!(key.is_sticky(), eq(true));
        assert_that!(key.has_expire(), eq(true));
        assert_that!(key.is_touched(), eq(false));
        key.set_sticky(false);
        assert_that!(key.is_sticky(), eq(false));
        assert_that!(key.has_expire(), eq(true));
    }

    #[rstest]
    #[case(b"short".to_vec(), 0)]
    #[case(vec![b'x'; 64], 64)]
    fn inline_keys_report_zero_heap_use(#[case] bytes: Vec<u8>, #[case] expected: usize) {
        let key = StoredKey::new(bytes);
        assert_that!(key.malloc_used(), eq(expected));
    }
}
