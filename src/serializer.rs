//! Element serialization boundary
//!
//! Disk stores only ever see the bytes produced here. Alternate
//! implementations (compression, encryption) plug in behind the trait.

use crate::element::CacheElement;
use crate::error::Result;

/// Turns elements into opaque bytes and back
pub trait ElementSerializer: Send + Sync {
    fn serialize(&self, element: &CacheElement) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<CacheElement>;
}

/// Default serializer using bincode
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl ElementSerializer for BincodeSerializer {
    fn serialize(&self, element: &CacheElement) -> Result<Vec<u8>> {
        Ok(bincode::serialize(element)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CacheElement> {
        Ok(bincode::deserialize(bytes)?)
    }
}
