use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// One record of a flush diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageOp {
    /// Copy `words` into the backing storage of `page`, starting at
    /// `offset_words` within the page.
    Bind {
        page: u32,
        offset_words: u32,
        words: Vec<u32>,
    },
    /// Release the page; subsequent reads from it are zeros.
    Unbind { page: u32 },
}

/// Receiver of flush diffs. Backends may batch the operations; device
/// synchronization, if any, is theirs to handle.
pub trait PageBackend {
    fn bind(&mut self, page: u32, offset_words: u32, words: &[u32]);
    fn unbind(&mut self, page: u32);
}

/// Records the raw operation stream, mostly useful in tests.
impl PageBackend for Vec<PageOp> {
    fn bind(&mut self, page: u32, offset_words: u32, words: &[u32]) {
        self.push(PageOp::Bind {
            page,
            offset_words,
            words: words.to_vec(),
        });
    }

    fn unbind(&mut self, page: u32) {
        self.push(PageOp::Unbind { page });
    }
}

/// An in-memory backend holding bound pages as plain word vectors.
#[derive(Debug)]
pub struct MemoryBackend {
    words_per_page: usize,
    pages: rustc_hash::FxHashMap<u32, Vec<u32>>,
}

impl MemoryBackend {
    pub fn new(words_per_page: u32) -> Self {
        MemoryBackend {
            words_per_page: words_per_page as usize,
            pages: Default::default(),
        }
    }

    pub fn page(&self, page: u32) -> Option<&[u32]> {
        self.pages.get(&page).map(|p| p.as_slice())
    }

    pub fn bound_pages(&self) -> usize {
        self.pages.len()
    }
}

impl PageBackend for MemoryBackend {
    fn bind(&mut self, page: u32, offset_words: u32, words: &[u32]) {
        let buf = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0; self.words_per_page]);
        let offset = offset_words as usize;
        buf[offset..offset + words.len()].copy_from_slice(words);
    }

    fn unbind(&mut self, page: u32) {
        self.pages.remove(&page);
    }
}

// -------------------------------------------------------------------------------------------------

struct Page {
    /// Materialized on first write. Absent pages read as zeros.
    words: OnceLock<Box<[AtomicU32]>>,
    /// Dirty word range `[lo, hi)`; clean when `lo >= hi`.
    dirty_lo: AtomicU32,
    dirty_hi: AtomicU32,
}

impl Page {
    fn empty(words_per_page: u32) -> Self {
        Page {
            words: OnceLock::new(),
            dirty_lo: AtomicU32::new(words_per_page),
            dirty_hi: AtomicU32::new(0),
        }
    }
}

/// A logical array of fixed-size pages, lazily materialized on first write.
///
/// Reads are lock-free and safe on never-written pages (they see zeros).
/// Writes to distinct pages are independent; writes to the same page must be
/// serialized by the caller, which also provides the publication edge for
/// readers (the node pool releases its per-bucket word counters after
/// writing, and readers acquire them before scanning). Each page tracks the
/// word range written since the last flush; `flush` emits exactly that diff.
pub struct PagedStore {
    word_bits_per_page: u32,
    pages: Box<[Page]>,
    freed: FxHashSet<u32>,
}

impl PagedStore {
    pub fn new(word_bits_per_page: u32, page_count: u32) -> Self {
        let words_per_page = 1u32 << word_bits_per_page;
        let pages = (0..page_count).map(|_| Page::empty(words_per_page)).collect();
        PagedStore {
            word_bits_per_page,
            pages,
            freed: FxHashSet::default(),
        }
    }

    #[inline]
    pub fn words_per_page(&self) -> u32 {
        1 << self.word_bits_per_page
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    #[inline]
    pub fn page_of(&self, addr: u32) -> u32 {
        addr >> self.word_bits_per_page
    }

    #[inline]
    fn offset_of(&self, addr: u32) -> u32 {
        addr & (self.words_per_page() - 1)
    }

    #[inline]
    pub fn is_resident(&self, page: u32) -> bool {
        self.pages[page as usize].words.get().is_some()
    }

    /// Number of currently materialized pages.
    pub fn resident_pages(&self) -> u32 {
        self.pages.iter().filter(|p| p.words.get().is_some()).count() as u32
    }

    /// Word slice of a page, or `None` if the page was never written.
    #[inline]
    pub fn page_words(&self, page: u32) -> Option<&[AtomicU32]> {
        self.pages[page as usize].words.get().map(|w| &w[..])
    }

    /// Reads one word; absent pages read as zero.
    #[inline]
    pub fn read_word(&self, addr: u32) -> u32 {
        match self.page_words(self.page_of(addr)) {
            Some(words) => words[self.offset_of(addr) as usize].load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Reads a word run, following page boundaries. Absent pages read as
    /// zeros.
    pub fn read_words(&self, mut addr: u32, dst: &mut [u32]) {
        let mut read = 0;
        while read < dst.len() {
            let offset = self.offset_of(addr) as usize;
            let run = dst.len().min(read + self.words_per_page() as usize - offset) - read;
            match self.page_words(self.page_of(addr)) {
                Some(words) => {
                    for i in 0..run {
                        dst[read + i] = words[offset + i].load(Ordering::Relaxed);
                    }
                }
                None => dst[read..read + run].fill(0),
            }
            read += run;
            addr += run as u32;
        }
    }

    /// Copies words into one page, materializing it on first write and
    /// extending the page's dirty range.
    pub fn write_page(&self, page: u32, offset: u32, src: &[u32]) {
        debug_assert!(offset + src.len() as u32 <= self.words_per_page());
        let entry = &self.pages[page as usize];
        let words = entry.words.get_or_init(|| {
            (0..self.words_per_page()).map(|_| AtomicU32::new(0)).collect()
        });
        for (i, &word) in src.iter().enumerate() {
            words[offset as usize + i].store(word, Ordering::Relaxed);
        }
        entry.dirty_lo.fetch_min(offset, Ordering::Relaxed);
        entry.dirty_hi.fetch_max(offset + src.len() as u32, Ordering::Relaxed);
    }

    /// Writes zeros; equivalent to `write_page` with a zero buffer, and like
    /// it marks the range dirty.
    pub fn zero_page(&self, page: u32, offset: u32, count: u32) {
        debug_assert!(offset + count <= self.words_per_page());
        let entry = &self.pages[page as usize];
        let words = entry.words.get_or_init(|| {
            (0..self.words_per_page()).map(|_| AtomicU32::new(0)).collect()
        });
        for i in offset..offset + count {
            words[i as usize].store(0, Ordering::Relaxed);
        }
        entry.dirty_lo.fetch_min(offset, Ordering::Relaxed);
        entry.dirty_hi.fetch_max(offset + count, Ordering::Relaxed);
    }

    /// Writes a word run starting at a word address, splitting across page
    /// boundaries as needed.
    pub fn write_words(&self, addr: u32, src: &[u32]) {
        let mut written = 0;
        while written < src.len() {
            let offset = self.offset_of(addr + written as u32);
            let run = (src.len() - written).min((self.words_per_page() - offset) as usize);
            self.write_page(
                self.page_of(addr + written as u32),
                offset,
                &src[written..written + run],
            );
            written += run;
        }
    }

    /// Releases a page's buffer and schedules an `Unbind` for the next
    /// flush. Reads of the page return zeros afterwards.
    pub fn free_page(&mut self, page: u32) {
        let words_per_page = self.words_per_page();
        let entry = &mut self.pages[page as usize];
        if entry.words.take().is_some() {
            entry.dirty_lo.store(words_per_page, Ordering::Relaxed);
            entry.dirty_hi.store(0, Ordering::Relaxed);
            self.freed.insert(page);
        }
    }

    /// Emits the accumulated diff: an `Unbind` per freed page, then a `Bind`
    /// per dirty page range, and clears both tracking sets. Requires `&mut`:
    /// flushing is single-threaded with respect to all other writes.
    pub fn flush(&mut self, backend: &mut dyn PageBackend) {
        let unbound = self.freed.len();
        for page in std::mem::take(&mut self.freed) {
            backend.unbind(page);
        }

        let mut bound = 0;
        let mut scratch = Vec::new();
        for (index, entry) in self.pages.iter().enumerate() {
            let lo = entry.dirty_lo.load(Ordering::Relaxed);
            let hi = entry.dirty_hi.load(Ordering::Relaxed);
            if lo >= hi {
                continue;
            }
            let words = entry.words.get().expect("dirty page must be resident");
            scratch.clear();
            scratch.extend((lo..hi).map(|i| words[i as usize].load(Ordering::Relaxed)));
            backend.bind(index as u32, lo, &scratch);
            entry.dirty_lo.store(self.words_per_page(), Ordering::Relaxed);
            entry.dirty_hi.store(0, Ordering::Relaxed);
            bound += 1;
        }
        if bound > 0 || unbound > 0 {
            log::debug!("flush: {} pages bound, {} unbound", bound, unbound);
        }
    }

    /// Swaps in the pages of a freshly built shadow store (the GC compact
    /// result). Pages resident here but not in the shadow are freed; pages
    /// resident in both are marked fully dirty so the next flush rebinds
    /// them from scratch, since the backend may hold stale content beyond
    /// the shadow's writes.
    pub fn replace_with(&mut self, shadow: PagedStore) {
        debug_assert_eq!(self.word_bits_per_page, shadow.word_bits_per_page);
        debug_assert_eq!(self.page_count(), shadow.page_count());

        for page in 0..self.page_count() {
            let survives = shadow.is_resident(page);
            if self.is_resident(page) && !survives {
                self.freed.insert(page);
            }
            if survives {
                self.freed.remove(&page);
                let entry = &shadow.pages[page as usize];
                entry.dirty_lo.store(0, Ordering::Relaxed);
                entry.dirty_hi.store(self.words_per_page(), Ordering::Relaxed);
            }
        }
        self.pages = shadow.pages;
    }
}

// -------------------------------------------------------------------------------------------------

/// An append-only vector of words on top of a [`PagedStore`]. Appends are
/// serialized by a lock and published with release semantics; reads of
/// already-published ranges are lock-free.
pub struct PagedVec {
    store: PagedStore,
    capacity_words: u32,
    used: AtomicU32,
    append_lock: Mutex<()>,
}

impl PagedVec {
    pub fn new(word_bits_per_page: u32, page_count: u32, capacity_words: u32) -> Self {
        debug_assert!(capacity_words as u64 <= (page_count as u64) << word_bits_per_page);
        PagedVec {
            store: PagedStore::new(word_bits_per_page, page_count),
            capacity_words,
            used: AtomicU32::new(0),
            append_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn store(&self) -> &PagedStore {
        &self.store
    }

    #[inline]
    pub fn store_mut(&mut self) -> &mut PagedStore {
        &mut self.store
    }

    #[inline]
    pub fn used_words(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// Appends a word run and returns its base address, or `None` when the
    /// capacity is exhausted.
    pub fn append(&self, words: &[u32]) -> Option<u32> {
        let _guard = self.append_lock.lock();
        let used = self.used.load(Ordering::Relaxed);
        if used as u64 + words.len() as u64 > self.capacity_words as u64 {
            return None;
        }
        self.store.write_words(used, words);
        self.used.store(used + words.len() as u32, Ordering::Release);
        Some(used)
    }

    /// Resets to the state of a shadow vector (see
    /// [`PagedStore::replace_with`]).
    pub fn replace_with(&mut self, shadow: PagedVec) {
        self.used.store(shadow.used.load(Ordering::Relaxed), Ordering::Relaxed);
        self.store.replace_with(shadow.store);
    }
}
