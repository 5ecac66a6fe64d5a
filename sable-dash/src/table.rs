//! Extendible-hashing table over versioned segments.

use std::mem;

use thiserror::Error;

use crate::cursor::Cursor;
use crate::policy::{BumpPolicy, EvictionPolicy, HotBuckets};
use crate::segment::{Bucket, Segment, Slot};

/// Slots per bucket.
pub const SLOTS_PER_BUCKET: usize = 14;
/// Regular (home/probe addressable) buckets per segment.
pub const REGULAR_BUCKETS: usize = 56;
/// Stash buckets per segment, shared by displaced entries.
pub const STASH_BUCKETS: usize = 4;
/// Total physical buckets per segment.
pub const BUCKETS_PER_SEGMENT: usize = REGULAR_BUCKETS + STASH_BUCKETS;

/// Directory depth cap. With SipHash fingerprints the directory never gets anywhere near this;
/// the cap only bounds pathological split recursion.
const MAX_GLOBAL_DEPTH: u8 = 40;

/// Position of one occupied slot. Positions are short-lived: any structural mutation of the
/// table may invalidate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotPos {
    /// Segment slab index.
    pub segment: u32,
    /// Bucket index within the segment.
    pub bucket: u8,
    /// Slot index within the bucket.
    pub slot: u8,
}

impl SlotPos {
    /// The bucket this slot belongs to.
    #[must_use]
    pub fn coord(self) -> BucketCoord {
        BucketCoord {
            segment: self.segment,
            bucket: self.bucket,
        }
    }
}

/// Physical bucket coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketCoord {
    /// Segment slab index.
    pub segment: u32,
    /// Bucket index within the segment.
    pub bucket: u8,
}

/// Insertion failure after growth, garbage collection, and eviction were all refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// No slot could be freed for the new entry.
    #[error("table is full and neither growth, garbage collection, nor eviction freed space")]
    Full,
}

/// Shared view of one physical bucket handed to traversal and change observers.
///
/// Observers may read entries and raise the bucket version, but cannot mutate entries; anything
/// they keep past the callback must be copied out.
pub struct BucketRef<'a, K, V> {
    coord: BucketCoord,
    cursor: Cursor,
    bucket: &'a Bucket<K, V>,
}

impl<'a, K, V> BucketRef<'a, K, V> {
    /// Bucket coordinate.
    #[must_use]
    pub fn coord(&self) -> BucketCoord {
        self.coord
    }

    /// Traversal cursor naming this bucket, comparable across directory growth.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Current bucket version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.bucket.version.get()
    }

    /// Raises the bucket version; never lowers it.
    pub fn set_version_at_least(&self, version: u64) {
        self.bucket.raise_version(version);
    }

    /// Iterates the occupied slots of this bucket.
    pub fn iter(&self) -> impl Iterator<Item = (SlotPos, &'a K, &'a V)> + 'a {
        let coord = self.coord;
        let bucket: &'a Bucket<K, V> = self.bucket;
        bucket.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.as_ref().map(|occupied| {
                (
                    SlotPos {
                        segment: coord.segment,
                        bucket: coord.bucket,
                        slot: index as u8,
                    },
                    &occupied.key,
                    &occupied.value,
                )
            })
        })
    }
}

/// Entry displaced by a segment split that did not fit its first target bucket set.
struct PendingEntry<K, V> {
    hash: u64,
    key: K,
    value: V,
    src_version: u64,
    src_cursor: Cursor,
}

/// Segmented hash table with per-bucket versions and an extendible directory.
#[derive(Debug)]
pub struct DashTable<K, V> {
    dir: Vec<u32>,
    segments: Vec<Segment<K, V>>,
    global_depth: u8,
    len: usize,
    stash_unloaded: u64,
}

impl<K, V> Default for DashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> DashTable<K, V> {
    /// Creates an empty table with a single segment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: vec![0],
            segments: vec![Segment::new(0, 0)],
            global_depth: 0,
            len: 0,
            stash_unloaded: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot capacity across all segments.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segments.len() * BUCKETS_PER_SEGMENT * SLOTS_PER_BUCKET
    }

    /// Number of allocated segments.
    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Current directory depth.
    #[must_use]
    pub fn depth(&self) -> u8 {
        self.global_depth
    }

    /// Next segment slab index with wraparound, used by eviction scans.
    #[must_use]
    pub fn next_segment(&self, segment: u32) -> u32 {
        (segment + 1) % self.segment_count()
    }

    /// Heap bytes held by the directory and segment arrays.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.dir.len() * mem::size_of::<u32>() + self.segments.len() * Self::segment_bytes()
    }

    /// Allocation size of one segment, used by conservative growth estimates.
    #[must_use]
    pub fn segment_bytes() -> usize {
        BUCKETS_PER_SEGMENT * mem::size_of::<Bucket<K, V>>()
    }

    /// Entries unloaded from stash buckets into regular buckets by bump-ups.
    #[must_use]
    pub fn stash_unloaded(&self) -> u64 {
        self.stash_unloaded
    }

    fn dir_index(&self, hash: u64) -> usize {
        if self.global_depth == 0 {
            0
        } else {
            (hash >> (64 - u32::from(self.global_depth))) as usize
        }
    }

    /// Segment slab index owning the given fingerprint.
    #[must_use]
    pub fn segment_for_hash(&self, hash: u64) -> u32 {
        self.dir[self.dir_index(hash)]
    }

    fn dir_span_of(&self, segment: u32) -> usize {
        1_usize << (self.global_depth - self.segments[segment as usize].local_depth)
    }

    /// Bucket coordinate addressed by a traversal cursor under the current directory shape.
    #[must_use]
    pub fn cursor_to_coord(&self, cursor: Cursor) -> Option<BucketCoord> {
        let bucket = cursor.bucket_id();
        if bucket as usize >= BUCKETS_PER_SEGMENT {
            return None;
        }
        let dir_idx = cursor.dir_index(self.global_depth).min(self.dir.len() - 1);
        Some(BucketCoord {
            segment: self.dir[dir_idx],
            bucket,
        })
    }

    /// Cursor naming the given bucket under the current directory shape.
    #[must_use]
    pub fn cursor_for(&self, coord: BucketCoord) -> Cursor {
        let seg = &self.segments[coord.segment as usize];
        Cursor::encode(coord.bucket, seg.dir_start, self.global_depth)
    }

    /// Shared view of one bucket.
    #[must_use]
    pub fn bucket_ref(&self, coord: BucketCoord) -> Option<BucketRef<'_, K, V>> {
        let seg = self.segments.get(coord.segment as usize)?;
        let bucket = seg.buckets.get(coord.bucket as usize)?;
        Some(BucketRef {
            coord,
            cursor: self.cursor_for(coord),
            bucket,
        })
    }

    /// Version of one bucket.
    #[must_use]
    pub fn bucket_version(&self, coord: BucketCoord) -> Option<u64> {
        self.bucket_ref(coord).map(|bucket| bucket.version())
    }

    /// Raises a bucket version; never lowers it.
    pub fn raise_bucket_version(&self, coord: BucketCoord, version: u64) {
        if let Some(bucket) = self.bucket_ref(coord) {
            bucket.set_version_at_least(version);
        }
    }

    fn slot_ref(&self, pos: SlotPos) -> Option<&Slot<K, V>> {
        self.segments
            .get(pos.segment as usize)?
            .buckets
            .get(pos.bucket as usize)?
            .slots
            .get(pos.slot as usize)?
            .as_ref()
    }

    /// Key/value pair at a position.
    #[must_use]
    pub fn get(&self, pos: SlotPos) -> Option<(&K, &V)> {
        self.slot_ref(pos).map(|slot| (&slot.key, &slot.value))
    }

    /// Key and mutable value at a position.
    pub fn get_mut(&mut self, pos: SlotPos) -> Option<(&K, &mut V)> {
        self.segments
            .get_mut(pos.segment as usize)?
            .buckets
            .get_mut(pos.bucket as usize)?
            .slots
            .get_mut(pos.slot as usize)?
            .as_mut()
            .map(|slot| (&slot.key, &mut slot.value))
    }

    /// Stored fingerprint at a position.
    #[must_use]
    pub fn hash_at(&self, pos: SlotPos) -> Option<u64> {
        self.slot_ref(pos).map(|slot| slot.hash)
    }

    /// Position handle when the given physical slot is occupied.
    #[must_use]
    pub fn occupied_at(&self, segment: u32, bucket: u8, slot: u8) -> Option<SlotPos> {
        let pos = SlotPos {
            segment,
            bucket,
            slot,
        };
        self.slot_ref(pos).map(|_| pos)
    }

    /// Locates an entry by fingerprint and key predicate.
    #[must_use]
    pub fn find(&self, hash: u64, mut is_match: impl FnMut(&K) -> bool) -> Option<SlotPos> {
        let seg_idx = self.segment_for_hash(hash);
        let seg = &self.segments[seg_idx as usize];
        let fp = fp_byte(hash);
        for bucket_id in candidate_buckets(home_bucket(hash)) {
            let bucket = &seg.buckets[bucket_id as usize];
            for (index, slot) in bucket.slots.iter().enumerate() {
                if bucket.fps[index] != fp {
                    continue;
                }
                if let Some(occupied) = slot
                    && occupied.hash == hash
                    && is_match(&occupied.key)
                {
                    return Some(SlotPos {
                        segment: seg_idx,
                        bucket: bucket_id,
                        slot: index as u8,
                    });
                }
            }
        }
        None
    }

    /// Locates the first entry with the given fingerprint, ignoring key bytes.
    ///
    /// Hash collisions make this an approximation; callers that use it (read-path bump-up)
    /// tolerate promoting a colliding neighbor.
    #[must_use]
    pub fn find_first(&self, hash: u64) -> Option<SlotPos> {
        self.find(hash, |_| true)
    }

    /// Removes the entry at a position and returns its key/value pair.
    ///
    /// The caller is responsible for having raised the bucket version through its pre-mutation
    /// protocol.
    pub fn erase(&mut self, pos: SlotPos) -> Option<(K, V)> {
        let bucket = self
            .segments
            .get_mut(pos.segment as usize)?
            .buckets
            .get_mut(pos.bucket as usize)?;
        let slot = bucket.take(pos.slot as usize)?;
        self.len -= 1;
        Some((slot.key, slot.value))
    }

    /// The hot bucket set for a colliding fingerprint.
    #[must_use]
    pub fn hot_buckets(&self, hash: u64) -> HotBuckets {
        let segment = self.segment_for_hash(hash);
        let home = home_bucket(hash);
        let probe = probe_bucket(home);
        let coord = |bucket: u8| BucketCoord { segment, bucket };
        HotBuckets {
            key_hash: hash,
            segment,
            regular: [coord(home), coord(probe)],
            stash: std::array::from_fn(|offset| coord((REGULAR_BUCKETS + offset) as u8)),
        }
    }

    /// Inserts a new entry, consulting the policy when the target segment is out of room.
    ///
    /// The caller guarantees the key is absent. On success the position of the new slot is
    /// returned; bucket versions are not touched here, the owning slice raises them through its
    /// pre-mutation protocol.
    ///
    /// # Errors
    ///
    /// Returns `InsertError::Full` when growth was refused and neither garbage collection nor
    /// eviction freed a slot.
    pub fn insert_new<P: EvictionPolicy<K, V>>(
        &mut self,
        hash: u64,
        key: K,
        value: V,
        policy: &mut P,
    ) -> Result<SlotPos, InsertError> {
        let mut key = key;
        let mut value = value;
        let mut rounds = 0_u32;
        loop {
            rounds += 1;
            if rounds > 128 {
                tracing::error!(hash, "insert loop failed to stabilize, rejecting entry");
                return Err(InsertError::Full);
            }
            let seg_idx = self.segment_for_hash(hash);
            match self.place_in_segment(seg_idx, hash, key, value) {
                Ok(pos) => {
                    self.len += 1;
                    return Ok(pos);
                }
                Err((returned_key, returned_value)) => {
                    key = returned_key;
                    value = returned_value;
                }
            }

            if self.segments[seg_idx as usize].local_depth < MAX_GLOBAL_DEPTH
                && policy.can_grow(self)
            {
                policy.record_split(seg_idx);
                let mut moves = Vec::new();
                self.split(seg_idx, &mut moves);
                for (source, dest) in moves {
                    policy.on_move(source, dest);
                }
                continue;
            }

            let hot = self.hot_buckets(hash);
            if policy.garbage_collect(&hot, self) > 0 {
                continue;
            }
            if policy.evict(&hot, self) > 0 {
                continue;
            }
            return Err(InsertError::Full);
        }
    }

    /// Places an entry in the home bucket, the probe bucket, or a stash bucket of one segment.
    fn place_in_segment(
        &mut self,
        seg_idx: u32,
        hash: u64,
        key: K,
        value: V,
    ) -> Result<SlotPos, (K, V)> {
        let fp = fp_byte(hash);
        let seg = &mut self.segments[seg_idx as usize];
        for bucket_id in candidate_buckets(home_bucket(hash)) {
            let bucket = &mut seg.buckets[bucket_id as usize];
            if let Some(slot_index) = bucket.free_slot() {
                bucket.place(slot_index, fp, Slot { hash, key, value });
                return Ok(SlotPos {
                    segment: seg_idx,
                    bucket: bucket_id,
                    slot: slot_index as u8,
                });
            }
        }
        Err((key, value))
    }

    fn double_directory(&mut self) {
        debug_assert!(self.global_depth < MAX_GLOBAL_DEPTH);
        let mut doubled = Vec::with_capacity(self.dir.len() * 2);
        for &entry in &self.dir {
            doubled.push(entry);
            doubled.push(entry);
        }
        self.dir = doubled;
        self.global_depth += 1;
        for seg in &mut self.segments {
            seg.dir_start *= 2;
        }
    }

    /// Splits a segment, then resolves any entries whose new target bucket set was full by
    /// splitting further. Terminates because each round consumes one hash prefix bit.
    fn split(&mut self, seg_idx: u32, moves: &mut Vec<(Cursor, Cursor)>) {
        let mut pending = self.split_segment(seg_idx, moves);
        let mut rounds = 0_u32;
        while let Some(entry) = pending.pop() {
            rounds += 1;
            assert!(
                rounds < 4096,
                "segment splitting cannot exhaust the hash prefix"
            );
            let target = self.segment_for_hash(entry.hash);
            match self.replace_pending(target, entry) {
                Ok(()) => {}
                Err(entry) => {
                    pending.push(entry);
                    let more = self.split_segment(target, moves);
                    pending.extend(more);
                }
            }
        }
    }

    fn replace_pending(
        &mut self,
        seg_idx: u32,
        entry: PendingEntry<K, V>,
    ) -> Result<(), PendingEntry<K, V>> {
        let PendingEntry {
            hash,
            key,
            value,
            src_version,
            src_cursor,
        } = entry;
        match self.place_in_segment(seg_idx, hash, key, value) {
            Ok(pos) => {
                let bucket = &self.segments[pos.segment as usize].buckets[pos.bucket as usize];
                bucket.raise_version(src_version);
                let _ = src_cursor;
                Ok(())
            }
            Err((key, value)) => Err(PendingEntry {
                hash,
                key,
                value,
                src_version,
                src_cursor,
            }),
        }
    }

    /// Splits one segment in half and redistributes its entries. Entries that no longer fit
    /// their target bucket set are returned for further splitting.
    fn split_segment(
        &mut self,
        seg_idx: u32,
        moves: &mut Vec<(Cursor, Cursor)>,
    ) -> Vec<PendingEntry<K, V>> {
        if self.segments[seg_idx as usize].local_depth == self.global_depth {
            self.double_directory();
        }

        let (old_dir_start, new_local_depth) = {
            let seg = &mut self.segments[seg_idx as usize];
            seg.local_depth += 1;
            (seg.dir_start, seg.local_depth)
        };
        let half_span = 1_usize << (self.global_depth - new_local_depth);
        let sibling_dir_start = old_dir_start + half_span;
        let sibling_idx = self.segments.len() as u32;
        self.segments
            .push(Segment::new(new_local_depth, sibling_dir_start));
        for entry in &mut self.dir[sibling_dir_start..sibling_dir_start + half_span] {
            *entry = sibling_idx;
        }

        // Drain and redistribute. Version inheritance: the destination bucket absorbs the source
        // bucket's version so a bucket never appears older than the entries that moved into it.
        let global_depth = self.global_depth;
        let mut drained = Vec::new();
        {
            let seg = &mut self.segments[seg_idx as usize];
            for bucket_id in 0..BUCKETS_PER_SEGMENT {
                let src_version = seg.buckets[bucket_id].version.get();
                let src_cursor = Cursor::encode(bucket_id as u8, old_dir_start, global_depth);
                for slot_index in 0..SLOTS_PER_BUCKET {
                    if let Some(slot) = seg.buckets[bucket_id].take(slot_index) {
                        drained.push(PendingEntry {
                            hash: slot.hash,
                            key: slot.key,
                            value: slot.value,
                            src_version,
                            src_cursor,
                        });
                    }
                }
            }
        }

        let mut leftovers = Vec::new();
        for entry in drained {
            let src_cursor = entry.src_cursor;
            let target = self.segment_for_hash(entry.hash);
            let src_version = entry.src_version;
            match self.place_in_segment(target, entry.hash, entry.key, entry.value) {
                Ok(pos) => {
                    let bucket =
                        &self.segments[pos.segment as usize].buckets[pos.bucket as usize];
                    bucket.raise_version(src_version);
                    let dst_cursor = self.cursor_for(pos.coord());
                    if dst_cursor != src_cursor {
                        moves.push((src_cursor, dst_cursor));
                    }
                }
                Err((key, value)) => leftovers.push(PendingEntry {
                    hash: entry.hash,
                    key,
                    value,
                    src_version,
                    src_cursor,
                }),
            }
        }
        leftovers
    }

    /// Visits one physical bucket and returns the cursor of the next one.
    ///
    /// Iteration is bucket-major (all segments for bucket 0, then bucket 1, ...) with the
    /// segment prefix left-aligned, so a cursor taken before directory growth resumes at the
    /// same key region afterwards. Every entry that stays put for the whole traversal is
    /// visited exactly once; entries relocated by concurrent splits may be revisited, which
    /// version-guarded consumers deduplicate.
    pub fn traverse_buckets<'a>(
        &'a self,
        cursor: Cursor,
        mut visit: impl FnMut(BucketRef<'a, K, V>),
    ) -> Cursor {
        let bucket_id = cursor.bucket_id();
        if bucket_id as usize >= BUCKETS_PER_SEGMENT {
            return Cursor::default();
        }
        let dir_idx = cursor.dir_index(self.global_depth).min(self.dir.len() - 1);
        let seg_idx = self.dir[dir_idx];
        // Canonicalize mid-span positions to the segment start.
        let dir_idx = self.segments[seg_idx as usize].dir_start;

        let coord = BucketCoord {
            segment: seg_idx,
            bucket: bucket_id,
        };
        visit(BucketRef {
            coord,
            cursor: Cursor::encode(bucket_id, dir_idx, self.global_depth),
            bucket: &self.segments[seg_idx as usize].buckets[bucket_id as usize],
        });

        let mut next_dir = dir_idx + self.dir_span_of(seg_idx);
        let mut next_bucket = bucket_id;
        if next_dir >= self.dir.len() {
            next_dir = 0;
            next_bucket += 1;
            if next_bucket as usize >= BUCKETS_PER_SEGMENT {
                return Cursor::default();
            }
        }
        Cursor::encode(next_bucket, next_dir, self.global_depth)
    }

    /// Visits every bucket an insert of the given fingerprint could touch, filtered to buckets
    /// whose version is below the bound.
    ///
    /// When the fingerprint's bucket set is already full the insert will split the segment, so
    /// every bucket of the segment becomes a candidate.
    pub fn cvc_upon_insert<'a>(
        &'a self,
        version_bound: u64,
        hash: u64,
        mut visit: impl FnMut(BucketRef<'a, K, V>),
    ) {
        let seg_idx = self.segment_for_hash(hash);
        let seg = &self.segments[seg_idx as usize];
        let home = home_bucket(hash);
        let set_is_full = candidate_buckets(home)
            .into_iter()
            .all(|bucket_id| seg.buckets[bucket_id as usize].is_full());

        let mut visit_bucket = |bucket_id: u8| {
            let bucket = &seg.buckets[bucket_id as usize];
            if bucket.version.get() < version_bound {
                let coord = BucketCoord {
                    segment: seg_idx,
                    bucket: bucket_id,
                };
                visit(BucketRef {
                    coord,
                    cursor: self.cursor_for(coord),
                    bucket,
                });
            }
        };

        if set_is_full {
            for bucket_id in 0..BUCKETS_PER_SEGMENT as u8 {
                visit_bucket(bucket_id);
            }
        } else {
            for bucket_id in candidate_buckets(home) {
                visit_bucket(bucket_id);
            }
        }
    }

    /// Visits every bucket a bump-up of the entry at `pos` could touch, filtered by version.
    pub fn cvc_upon_bump<'a>(
        &'a self,
        version_bound: u64,
        pos: SlotPos,
        mut visit: impl FnMut(BucketRef<'a, K, V>),
    ) {
        let Some(hash) = self.hash_at(pos) else {
            return;
        };
        let home = home_bucket(hash);
        let mut bucket_ids = vec![pos.bucket, home, probe_bucket(home)];
        bucket_ids.dedup();
        for bucket_id in bucket_ids {
            let coord = BucketCoord {
                segment: pos.segment,
                bucket: bucket_id,
            };
            if let Some(bucket) = self.bucket_ref(coord)
                && bucket.version() < version_bound
            {
                visit(bucket);
            }
        }
    }

    /// Promotes an entry toward the head of its bucket group.
    ///
    /// Stash entries move into a free slot of their home or probe bucket; regular entries swap
    /// into slot zero. The logical entry set never changes, only positions do.
    pub fn bump_up<P: BumpPolicy<K>>(&mut self, pos: SlotPos, policy: &mut P) -> SlotPos {
        let Some(hash) = self.hash_at(pos) else {
            return pos;
        };
        {
            let Some((key, _)) = self.get(pos) else {
                return pos;
            };
            if !policy.can_bump(key) {
                return pos;
            }
        }

        let home = home_bucket(hash);
        if pos.bucket as usize >= REGULAR_BUCKETS {
            for target_bucket in [home, probe_bucket(home)] {
                let src_coord = pos.coord();
                let dst_coord = BucketCoord {
                    segment: pos.segment,
                    bucket: target_bucket,
                };
                let seg = &mut self.segments[pos.segment as usize];
                let Some(free) = seg.buckets[target_bucket as usize].free_slot() else {
                    continue;
                };
                let src_version = seg.buckets[pos.bucket as usize].version.get();
                let Some(slot) = seg.buckets[pos.bucket as usize].take(pos.slot as usize) else {
                    return pos;
                };
                let fp = fp_byte(slot.hash);
                seg.buckets[target_bucket as usize].place(free, fp, slot);
                seg.buckets[target_bucket as usize].raise_version(src_version);
                self.stash_unloaded += 1;
                policy.on_move(self.cursor_for(src_coord), self.cursor_for(dst_coord));
                return SlotPos {
                    segment: pos.segment,
                    bucket: target_bucket,
                    slot: free as u8,
                };
            }
            return pos;
        }

        if pos.slot == 0 {
            return pos;
        }
        let bucket =
            &mut self.segments[pos.segment as usize].buckets[pos.bucket as usize];
        bucket.slots.swap(0, pos.slot as usize);
        bucket.fps.swap(0, pos.slot as usize);
        SlotPos { slot: 0, ..pos }
    }

    /// Slides a bucket's entries one slot toward the tail, closing the gap left by evicting the
    /// last slot and freeing slot zero for fresh inserts.
    pub fn shift_right(&mut self, coord: BucketCoord) {
        let Some(seg) = self.segments.get_mut(coord.segment as usize) else {
            return;
        };
        let Some(bucket) = seg.buckets.get_mut(coord.bucket as usize) else {
            return;
        };
        bucket.slots.rotate_right(1);
        bucket.fps.rotate_right(1);
    }
}

fn fp_byte(hash: u64) -> u8 {
    (hash & 0xFF) as u8
}

fn home_bucket(hash: u64) -> u8 {
    ((hash >> 8) % REGULAR_BUCKETS as u64) as u8
}

fn probe_bucket(home: u8) -> u8 {
    ((usize::from(home) + 1) % REGULAR_BUCKETS) as u8
}

/// Home bucket, probe bucket, then the stash buckets: the full lookup set for one fingerprint.
fn candidate_buckets(home: u8) -> [u8; 2 + STASH_BUCKETS] {
    [
        home,
        probe_bucket(home),
        REGULAR_BUCKETS as u8,
        REGULAR_BUCKETS as u8 + 1,
        REGULAR_BUCKETS as u8 + 2,
        REGULAR_BUCKETS as u8 + 3,
    ]
}
