//! Wire fixtures shared by the parser benchmarks.

use bytes::{Bytes, BytesMut};

/// A message stored with `\n` line ends, served with the `\r\n` the wire uses.
#[derive(Debug, Copy, Clone)]
pub struct Fixture {
    name: &'static str,
    content: &'static str,
}

impl Fixture {
    pub const fn new(name: &'static str, content: &'static str) -> Self {
        Self { name, content }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn wire(&self) -> BytesMut {
        BytesMut::from(self.content.replace('\n', "\r\n").as_bytes())
    }

    /// The wire bytes cut into reads of at most `size` bytes.
    pub fn reads(&self, size: usize) -> Vec<Bytes> {
        let wire = self.wire().freeze();
        let size = size.max(1);
        (0..wire.len()).step_by(size).map(|start| wire.slice(start..wire.len().min(start.saturating_add(size)))).collect()
    }
}
