//! Record Key Index
//!
//! Key → (offset, length) map persisted to a dedicated key file.

use crate::index::KeyIndex;

use super::RecordDescriptor;

/// Key index over a [`super::RecordStore`]
pub type RecordKeyIndex = KeyIndex<RecordDescriptor>;

impl KeyIndex<RecordDescriptor> {
    /// Drop entries whose record extends past `file_len`
    ///
    /// Expected after a crash between a data write and a key save.
    pub fn drop_past_end(&self, file_len: u64) -> usize {
        let dropped = self.retain(|_, desc| desc.end() <= file_len);
        if !dropped.is_empty() {
            tracing::warn!(
                "Dropped {} key index entries past end of data file ({} bytes)",
                dropped.len(),
                file_len
            );
        }
        dropped.len()
    }

    /// True when two live records share bytes
    pub fn has_overlaps(&self) -> bool {
        let mut descs: Vec<RecordDescriptor> =
            self.entries().into_iter().map(|(_, desc)| desc).collect();
        descs.sort_by_key(|desc| desc.pos);

        descs.windows(2).any(|pair| pair[0].end() > pair[1].pos)
    }

    /// Live descriptors, in no particular order
    pub fn descriptors(&self) -> Vec<RecordDescriptor> {
        self.entries().into_iter().map(|(_, desc)| desc).collect()
    }
}
