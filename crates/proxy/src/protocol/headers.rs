//! An insertion ordered, case-insensitive header multi-map.
//!
//! Headers are kept in an append-only arena so that the wire order of the
//! message is preserved exactly, duplicates included. A side index maps every
//! lowercase name to the first and last arena slot carrying it, and each entry
//! links to the next entry with the same name. This gives:
//!
//! - sequential iteration in wire order,
//! - iteration over one name in its insertion order,
//! - removal of every entry of a name without disturbing the others.
//!
//! Removed entries leave an empty slot behind; slots are only reclaimed by
//! [`Headers::clear`], which happens once per message.

use bytes::Bytes;
use std::collections::HashMap;

/// A single `name: value` pair as it appeared on the wire.
///
/// The name keeps its original case and can not be changed once stored,
/// while the value is free to be rewritten in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    #[inline]
    pub fn name(&self) -> &Bytes {
        &self.name
    }

    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

#[derive(Debug, Clone)]
struct Entry {
    header: Header,
    next_same_name: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct NameIndex {
    first: usize,
    last: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Headers {
    slots: Vec<Option<Entry>>,
    by_name: HashMap<Vec<u8>, NameIndex>,
    len: usize,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header. Entries with the same name are never merged.
    pub fn push_back(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let header = Header::new(name, value);
        let idx = self.slots.len();
        let key = header.name.to_ascii_lowercase();

        match self.by_name.get_mut(&key) {
            Some(index) => {
                if let Some(Some(last)) = self.slots.get_mut(index.last) {
                    last.next_same_name = Some(idx);
                }
                index.last = idx;
            }
            None => {
                self.by_name.insert(key, NameIndex { first: idx, last: idx });
            }
        }

        self.slots.push(Some(Entry { header, next_same_name: None }));
        self.len += 1;
    }

    /// Iterates over every header named `name`, ignoring case, in insertion order.
    pub fn find(&self, name: impl AsRef<[u8]>) -> Find<'_> {
        let next = self.by_name.get(name.as_ref().to_ascii_lowercase().as_slice()).map(|index| index.first);
        Find { slots: &self.slots, next }
    }

    /// The value of the first header named `name`.
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<&Bytes> {
        self.find(name).next().map(Header::value)
    }

    pub fn get_mut(&mut self, name: impl AsRef<[u8]>) -> Option<&mut Header> {
        let idx = self.by_name.get(name.as_ref().to_ascii_lowercase().as_slice())?.first;
        self.slots.get_mut(idx)?.as_mut().map(|entry| &mut entry.header)
    }

    pub fn contains(&self, name: impl AsRef<[u8]>) -> bool {
        self.by_name.contains_key(name.as_ref().to_ascii_lowercase().as_slice())
    }

    /// Removes every header named `name`, ignoring case, and returns how many were removed.
    pub fn erase_all(&mut self, name: impl AsRef<[u8]>) -> usize {
        let Some(index) = self.by_name.remove(name.as_ref().to_ascii_lowercase().as_slice()) else {
            return 0;
        };

        let mut removed = 0;
        let mut cursor = Some(index.first);
        while let Some(idx) = cursor {
            cursor = self.slots.get_mut(idx).and_then(Option::take).and_then(|entry| {
                removed += 1;
                entry.next_same_name
            });
        }

        self.len -= removed;
        removed
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_name.clear();
        self.len = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Iterates over all headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.slots.iter().flatten().map(|entry| &entry.header)
    }

    /// Iterates mutably over all headers in wire order; only values may be changed.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Header> {
        self.slots.iter_mut().flatten().map(|entry| &mut entry.header)
    }
}

impl<N: Into<Bytes>, V: Into<Bytes>> Extend<(N, V)> for Headers {
    fn extend<T: IntoIterator<Item = (N, V)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.push_back(name, value);
        }
    }
}

impl<N: Into<Bytes>, V: Into<Bytes>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        headers.extend(iter);
        headers
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Box<dyn Iterator<Item = &'a Header> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Iterator over the headers sharing one name, see [`Headers::find`].
#[derive(Debug)]
pub struct Find<'a> {
    slots: &'a [Option<Entry>],
    next: Option<usize>,
}

impl<'a> Iterator for Find<'a> {
    type Item = &'a Header;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.slots.get(self.next?)?.as_ref()?;
        self.next = entry.next_same_name;
        Some(&entry.header)
    }
}
