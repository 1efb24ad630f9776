use std::fmt;

/// Identifier of a generated document: the sequence number drawn from the shared id source plus
/// the index of the writer that produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocId {
    seq: u64,
    writer: usize,
}

impl DocId {
    #[inline]
    pub fn new(seq: u64, writer: usize) -> Self {
        Self { seq, writer }
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn writer(&self) -> usize {
        self.writer
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.seq, self.writer)
    }
}

impl From<DocId> for u64 {
    #[inline]
    fn from(value: DocId) -> Self {
        value.seq
    }
}
