use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};

enum StreamKind<'a> {
    View(Cursor<&'a [u8]>),
    File { reader: BufReader<File>, len: u64 },
}

/// A readable handle to one file.
///
/// Archive members are served as views into the mapped archive; loose
/// files get a buffered handle of their own. Streams count themselves
/// against their origin while alive.
pub struct EntryStream<'a> {
    kind: StreamKind<'a>,
    open: Option<&'a AtomicUsize>,
}

impl<'a> EntryStream<'a> {
    pub(crate) fn view(data: &'a [u8], open: &'a AtomicUsize) -> Self {
        open.fetch_add(1, Ordering::Relaxed);
        Self {
            kind: StreamKind::View(Cursor::new(data)),
            open: Some(open),
        }
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            kind: StreamKind::File {
                reader: BufReader::new(file),
                len,
            },
            open: None,
        })
    }

    pub fn len(&self) -> u64 {
        match &self.kind {
            StreamKind::View(cursor) => cursor.get_ref().len() as u64,
            StreamKind::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole file, when it is a view into memory.
    pub fn as_slice(&self) -> Option<&'a [u8]> {
        match &self.kind {
            StreamKind::View(cursor) => Some(cursor.get_ref()),
            StreamKind::File { .. } => None,
        }
    }

    pub fn is_view(&self) -> bool {
        matches!(self.kind, StreamKind::View(_))
    }
}

impl Read for EntryStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            StreamKind::View(cursor) => cursor.read(buf),
            StreamKind::File { reader, .. } => reader.read(buf),
        }
    }
}

impl Seek for EntryStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.kind {
            StreamKind::View(cursor) => cursor.seek(pos),
            StreamKind::File { reader, .. } => reader.seek(pos),
        }
    }
}

impl Drop for EntryStream<'_> {
    fn drop(&mut self) {
        if let Some(open) = self.open {
            open.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_counts_itself() {
        let open = AtomicUsize::new(0);
        let data = b"0123456789";

        let mut stream = EntryStream::view(&data[2..6], &open);
        assert_eq!(open.load(Ordering::Relaxed), 1);
        assert_eq!(stream.len(), 4);

        stream.seek(SeekFrom::Start(1)).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "345");

        drop(stream);
        assert_eq!(open.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_file_stream() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"payload").unwrap();

        let mut stream = EntryStream::from_file(tmp.reopen().unwrap()).unwrap();
        assert!(!stream.is_view());
        assert_eq!(stream.len(), 7);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
    }
}
