use std::borrow::Cow;

/// Raw byte range of a stored file inside an archive.
///
/// A zero size is the not-found sentinel; archives never serve empty files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ZipEntry {
    pub offset: u64,
    pub size: u64,
}

impl ZipEntry {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn is_found(&self) -> bool {
        self.size != 0
    }
}

/// How entry names are handed out when iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZipIoEntryKind {
    /// Borrowed from the index
    #[default]
    View,
    /// Owned copies, independent of the index
    String,
}

/// An archive member: its byte range plus its full path.
///
/// An empty name marks "not found".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZipIoEntry<'a> {
    pub entry: ZipEntry,
    pub name: Cow<'a, str>,
}

impl<'a> ZipIoEntry<'a> {
    pub fn borrowed(entry: ZipEntry, name: &'a str) -> Self {
        Self {
            entry,
            name: Cow::Borrowed(name),
        }
    }

    pub fn is_found(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn into_owned(self) -> ZipIoEntry<'static> {
        ZipIoEntry {
            entry: self.entry,
            name: Cow::Owned(self.name.into_owned()),
        }
    }

    pub fn with_kind(self, kind: ZipIoEntryKind) -> Self {
        match kind {
            ZipIoEntryKind::View => self,
            ZipIoEntryKind::String => Self {
                entry: self.entry,
                name: Cow::Owned(self.name.into_owned()),
            },
        }
    }
}
