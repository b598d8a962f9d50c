//! Incremental cache builder.
//!
//! Files are fed from the producer thread and applied to the trie on a
//! dedicated builder thread, so the substring searches of a large string
//! pool overlap with whatever the producer does next (usually copying the
//! next entry's data). [`CacheGenerator::wait_and_write`] joins the builder
//! and serializes the result.

use byteorder::{NativeEndian, WriteBytesExt};
use crossbeam_channel::{Sender, unbounded};
use flate2::Crc;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::format::*;
use super::slider::{self, StringSlider};
use crate::error::{Error, Result};

pub use super::slider::Metrics;

/// A string stored in the slider pool.
#[derive(Debug, Clone, Copy, Default)]
struct PoolStr {
    offset: usize,
    len: usize,
}

struct NodeGen {
    parent: usize,
    depth: usize,
    name: PoolStr,
    inline_name: Option<Box<str>>,
    children: BTreeMap<Box<str>, usize>,
    finals: BTreeMap<Box<str>, usize>,
}

struct EntryGen {
    offset: u64,
    size: u64,
    parent: usize,
    path: PoolStr,
    name: PoolStr,
    inline_name: Option<Box<str>>,
}

const ROOT: usize = 0;

/// Arena trie; node 0 is the root, parents are indices.
struct Builder {
    nodes: Vec<NodeGen>,
    entries: Vec<EntryGen>,
    /// Every entry keyed by full path, the order of the entry records
    sorted: BTreeMap<Box<str>, usize>,
    slider: StringSlider,
    num_levels: usize,
    max_path_size: usize,
}

impl Builder {
    fn new() -> Self {
        Self {
            nodes: vec![NodeGen {
                parent: ROOT,
                depth: 0,
                name: PoolStr::default(),
                inline_name: None,
                children: BTreeMap::new(),
                finals: BTreeMap::new(),
            }],
            entries: Vec::new(),
            sorted: BTreeMap::new(),
            slider: StringSlider::new(),
            num_levels: 0,
            max_path_size: 0,
        }
    }

    /// Place a name either inline or in the pool.
    ///
    /// Short names are kept aside and copied into their record verbatim;
    /// longer ones go through the slider and are referenced.
    fn intern_name(&mut self, name: &str) -> (PoolStr, Option<Box<str>>) {
        if name.len() <= INLINE_NAME_SIZE {
            let pool = PoolStr {
                offset: 0,
                len: name.len(),
            };
            return (pool, Some(name.into()));
        }

        let offset = self.slider.insert(name.as_bytes());
        let pool = PoolStr {
            offset,
            len: name.len(),
        };
        (pool, None)
    }

    fn add_file(&mut self, path: &str, offset: u64, size: u64) {
        let parts: Vec<&str> = split_path(path).collect();
        let Some((file_name, folders)) = parts.split_last() else {
            return;
        };

        let full_path = parts.join("/");
        self.num_levels = self.num_levels.max(parts.len());
        self.max_path_size = self.max_path_size.max(full_path.len());

        if let Some(&existing) = self.sorted.get(full_path.as_str()) {
            // Re-added path, keep the latest data
            let entry = &mut self.entries[existing];
            entry.offset = offset;
            entry.size = size;
            return;
        }

        let path_offset = self.slider.insert(full_path.as_bytes());
        let mut current = ROOT;

        for folder in folders {
            current = match self.nodes[current].children.get(*folder) {
                Some(&child) => child,
                None => {
                    let (name, inline_name) = self.intern_name(folder);
                    let child = self.nodes.len();
                    let depth = self.nodes[current].depth + 1;
                    self.nodes.push(NodeGen {
                        parent: current,
                        depth,
                        name,
                        inline_name,
                        children: BTreeMap::new(),
                        finals: BTreeMap::new(),
                    });
                    self.nodes[current].children.insert((*folder).into(), child);
                    child
                }
            };
        }

        let (name, inline_name) = self.intern_name(file_name);
        let index = self.entries.len();
        self.entries.push(EntryGen {
            offset,
            size,
            parent: current,
            path: PoolStr {
                offset: path_offset,
                len: full_path.len(),
            },
            name,
            inline_name,
        });
        self.nodes[current].finals.insert((*file_name).into(), index);
        self.sorted.insert(full_path.into(), index);
    }

    fn header(&self, meta: &CacheMeta) -> CacheBaseHeader {
        CacheBaseHeader {
            num_levels: self.num_levels as u8,
            max_path_size: self.max_path_size as u16,
            num_files: self.entries.len() as u32,
            zip_crc: meta.zip_crc.sum(),
            zip_size: meta.zip_size,
            zip_checkup_offset: meta.zip_checkup_offset,
        }
    }

    /// Serialize in two passes: assign every record its position, then emit
    /// records with references computed from those positions.
    fn write<W: Write>(&self, header: &CacheBaseHeader, w: &mut W) -> Result<()> {
        let pool_start = HEADER_SIZE;
        let entries_start = (pool_start + self.slider.len()).next_multiple_of(8);

        let mut entry_pos = vec![0usize; self.entries.len()];
        for (i, &index) in self.sorted.values().enumerate() {
            entry_pos[index] = entries_start + i * ENTRY_SIZE;
        }

        // Deepest level first, root last
        let mut node_order: Vec<usize> = (1..self.nodes.len()).collect();
        node_order.sort_by_key(|&i| std::cmp::Reverse(self.nodes[i].depth));
        node_order.push(ROOT);

        let mut node_pos = vec![0usize; self.nodes.len()];
        let mut cursor = entries_start + self.entries.len() * ENTRY_SIZE;
        for &i in &node_order {
            let node = &self.nodes[i];
            node_pos[i] = cursor;
            cursor += NODE_FIXED_SIZE + 4 * (node.children.len() + node.finals.len());
        }

        let total = cursor;
        let cache_size = u32::try_from(total)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cache exceeds 4 GiB"))?;

        let mut out = RecordWriter::with_capacity(total);

        // Header
        out.buf.extend_from_slice(&header.to_bytes());
        out.buf.write_u32::<NativeEndian>(cache_size)?;
        out.rel(node_pos[ROOT])?;
        out.rel(entries_start)?;
        out.buf.write_u32::<NativeEndian>(0)?;

        // String pool
        out.buf.extend_from_slice(self.slider.as_bytes());
        out.pad_to(entries_start);

        // Entries
        for &index in self.sorted.values() {
            let entry = &self.entries[index];
            out.buf.write_u64::<NativeEndian>(entry.offset)?;
            out.buf.write_u64::<NativeEndian>(entry.size)?;
            out.rel(node_pos[entry.parent])?;
            out.rel(pool_start + entry.path.offset)?;
            out.name(&entry.name, entry.inline_name.as_deref(), pool_start)?;
            out.buf.write_u16::<NativeEndian>(entry.name.len as u16)?;
            out.buf.write_u16::<NativeEndian>(entry.path.len as u16)?;
            out.buf.write_u32::<NativeEndian>(0)?;
        }

        // Nodes
        for &i in &node_order {
            let node = &self.nodes[i];
            debug_assert_eq!(out.buf.len(), node_pos[i]);

            if i == ROOT {
                out.buf.write_i32::<NativeEndian>(0)?;
            } else {
                out.rel(node_pos[node.parent])?;
            }
            out.buf.write_u32::<NativeEndian>(node.children.len() as u32)?;
            out.buf.write_u32::<NativeEndian>(node.finals.len() as u32)?;
            out.buf.write_u16::<NativeEndian>(node.name.len as u16)?;
            out.buf.write_u16::<NativeEndian>(0)?;
            out.name(&node.name, node.inline_name.as_deref(), pool_start)?;

            for &child in node.children.values() {
                out.rel(node_pos[child])?;
            }
            for &entry in node.finals.values() {
                out.rel(entry_pos[entry])?;
            }
        }

        w.write_all(&out.buf)?;
        Ok(())
    }
}

struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Write a reference to `target` at the current position.
    fn rel(&mut self, target: usize) -> io::Result<()> {
        let delta = target as i64 - self.buf.len() as i64;
        let delta = i32::try_from(delta)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "reference out of range"))?;
        self.buf.write_i32::<NativeEndian>(delta)
    }

    fn name(&mut self, name: &PoolStr, inline: Option<&str>, pool_start: usize) -> io::Result<()> {
        match inline {
            Some(inline) => {
                let mut field = [0u8; INLINE_NAME_SIZE];
                field[..inline.len()].copy_from_slice(inline.as_bytes());
                self.buf.extend_from_slice(&field);
                Ok(())
            }
            None => {
                self.rel(pool_start + name.offset)?;
                self.buf.write_u32::<NativeEndian>(0)
            }
        }
    }

    fn pad_to(&mut self, pos: usize) {
        self.buf.resize(pos, 0);
    }
}

/// Archive-level fields of the header, owned by the producer.
struct CacheMeta {
    zip_crc: Crc,
    zip_size: u64,
    zip_checkup_offset: u64,
}

enum Command {
    AddFile { path: String, offset: u64, size: u64 },
}

/// Builds a cache from `(path, offset, size)` triples.
///
/// Single writer: one producer feeds it, then calls
/// [`wait_and_write`](Self::wait_and_write) once.
pub struct CacheGenerator {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<Builder>>,
    /// Used when no builder thread could be spawned
    inline: Option<Builder>,
    meta: CacheMeta,
}

impl Default for CacheGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheGenerator {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Command>();

        let spawned = thread::Builder::new()
            .name("cache_builder".to_string())
            .spawn(move || {
                let mut builder = Builder::new();
                for command in receiver {
                    match command {
                        Command::AddFile { path, offset, size } => {
                            builder.add_file(&path, offset, size)
                        }
                    }
                }
                builder
            });

        let (sender, worker, inline) = match spawned {
            Ok(worker) => (Some(sender), Some(worker), None),
            Err(e) => {
                warn!("Cannot spawn cache builder thread, building inline: {}", e);
                (None, None, Some(Builder::new()))
            }
        };

        Self {
            sender,
            worker,
            inline,
            meta: CacheMeta {
                zip_crc: Crc::new(),
                zip_size: 0,
                zip_checkup_offset: 0,
            },
        }
    }

    /// Queue a file for the cache.
    ///
    /// The path is split on `/` and `\`. Re-adding a path replaces its
    /// previous offset and size.
    pub fn add_file(&mut self, path: &str, offset: u64, size: u64) -> Result<()> {
        let depth = split_path(path).count();
        if depth == 0 || depth > MAX_LEVELS {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let normalized_len = split_path(path).map(str::len).sum::<usize>() + depth - 1;
        if normalized_len > u16::MAX as usize {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let command = Command::AddFile {
            path: path.to_string(),
            offset,
            size,
        };

        match (&self.sender, &mut self.inline) {
            (Some(sender), _) => {
                if sender.send(command).is_err() {
                    return Err(builder_died());
                }
            }
            (None, Some(builder)) => {
                let Command::AddFile { path, offset, size } = command;
                builder.add_file(&path, offset, size);
            }
            (None, None) => return Err(builder_died()),
        }

        Ok(())
    }

    /// Chain an archive entry's CRC into the header's `zip_crc`.
    pub fn update_crc(&mut self, entry_crc: u32) {
        self.meta.zip_crc.update(&entry_crc.to_ne_bytes());
    }

    pub fn set_zip_size(&mut self, size: u64) {
        self.meta.zip_size = size;
    }

    pub fn set_checkup_offset(&mut self, offset: u64) {
        self.meta.zip_checkup_offset = offset;
    }

    /// Join the builder thread and serialize the cache into `w`.
    ///
    /// Returns the header that was written, which the caller embeds in the
    /// paired archive as the checkup record.
    pub fn wait_and_write<W: Write>(mut self, w: &mut W) -> Result<CacheBaseHeader> {
        drop(self.sender.take());

        let builder = match (self.worker.take(), self.inline.take()) {
            (Some(worker), _) => worker.join().map_err(|_| builder_died())?,
            (None, Some(builder)) => builder,
            (None, None) => return Err(builder_died()),
        };

        let header = builder.header(&self.meta);
        debug!(
            "Writing cache: {} files, {} levels, {} pool bytes",
            header.num_files,
            header.num_levels,
            builder.slider.len()
        );
        builder.write(&header, w)?;
        Ok(header)
    }

    pub fn global_metrics() -> Metrics {
        slider::global_metrics()
    }
}

fn builder_died() -> Error {
    Error::Io(io::Error::other("cache builder thread terminated"))
}
