//! Append-only string pool with substring reuse.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Buffers larger than this are searched in parallel chunks.
pub const PARALLEL_SEARCH_THRESHOLD: usize = 0x40000;

static NUM_SEARCH_HITS: AtomicUsize = AtomicUsize::new(0);
static NUM_SEARCH_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Process-wide substring search counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub num_search_hits: usize,
    pub num_search_misses: usize,
}

pub fn global_metrics() -> Metrics {
    Metrics {
        num_search_hits: NUM_SEARCH_HITS.load(Ordering::Relaxed),
        num_search_misses: NUM_SEARCH_MISSES.load(Ordering::Relaxed),
    }
}

/// Boyer-Moore-Horspool search, returns the first occurrence.
fn horspool(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let n = needle.len();
    if n == 0 {
        return Some(0);
    }
    if haystack.len() < n {
        return None;
    }

    let mut shift = [n; 256];
    for (i, &b) in needle[..n - 1].iter().enumerate() {
        shift[b as usize] = n - 1 - i;
    }

    let last = needle[n - 1];
    let mut pos = 0;

    while pos + n <= haystack.len() {
        let tail = haystack[pos + n - 1];
        if tail == last && haystack[pos..pos + n - 1] == needle[..n - 1] {
            return Some(pos);
        }
        pos += shift[tail as usize];
    }

    None
}

/// Deduplicating string buffer.
///
/// Strings are only appended when they cannot be found anywhere in the
/// buffer. When the buffer's tail already spells the start of a new string,
/// only the missing remainder is appended.
#[derive(Default)]
pub struct StringSlider {
    buffer: Vec<u8>,
    pool: OnceLock<Option<ThreadPool>>,
}

impl StringSlider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn get(&self, offset: usize, len: usize) -> &[u8] {
        &self.buffer[offset..offset + len]
    }

    fn search_pool(&self) -> Option<&ThreadPool> {
        self.pool
            .get_or_init(|| {
                ThreadPoolBuilder::new()
                    .num_threads(num_cpus::get())
                    .thread_name(|i| format!("slider_search_{}", i))
                    .build()
                    .map_err(|e| warn!("Falling back to serial string search: {}", e))
                    .ok()
            })
            .as_ref()
    }

    /// Offset of the first occurrence of `needle` in the buffer.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if self.buffer.len() <= PARALLEL_SEARCH_THRESHOLD || needle.is_empty() {
            return horspool(&self.buffer, needle);
        }

        let Some(pool) = self.search_pool() else {
            return horspool(&self.buffer, needle);
        };

        let num_chunks = pool.current_num_threads().max(1);
        let chunk_size = self.buffer.len().div_ceil(num_chunks);
        let overlap = needle.len() - 1;
        let buffer = &self.buffer;

        // Neighbouring chunks overlap so matches across a boundary are seen
        pool.install(|| {
            (0..num_chunks)
                .into_par_iter()
                .filter_map(|i| {
                    let begin = i * chunk_size;
                    if begin >= buffer.len() {
                        return None;
                    }
                    let end = (begin + chunk_size + overlap).min(buffer.len());
                    horspool(&buffer[begin..end], needle).map(|pos| begin + pos)
                })
                .min()
        })
    }

    /// Insert `s`, returning its offset in the buffer.
    pub fn insert(&mut self, s: &[u8]) -> usize {
        if let Some(pos) = self.find(s) {
            NUM_SEARCH_HITS.fetch_add(1, Ordering::Relaxed);
            return pos;
        }

        NUM_SEARCH_MISSES.fetch_add(1, Ordering::Relaxed);

        // Longest buffer tail that is a prefix of s. A full-length overlap
        // would have been found above.
        let max_overlap = s.len().saturating_sub(1).min(self.buffer.len());
        let overlap = (1..=max_overlap)
            .rev()
            .find(|&k| self.buffer.ends_with(&s[..k]))
            .unwrap_or(0);

        let offset = self.buffer.len() - overlap;
        self.buffer.extend_from_slice(&s[overlap..]);
        offset
    }
}
