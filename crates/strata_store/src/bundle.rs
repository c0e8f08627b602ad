//! Compressed multi-array bundles.
//!
//! A bundle is an ordered set of named, shaped `f64` arrays serialized as a
//! little-endian record stream and gzip-compressed. The store treats the
//! result as an opaque payload; this module owns the encode/decode pair.

use crate::backend::{StoreError, StoreResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Read, Write};

const MAGIC: &[u8; 4] = b"SFB1";

/// One named array: row-major data with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Vec<u64>,
    data: Vec<f64>,
}

impl Array {
    /// A rank-1 array.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self { shape: vec![data.len() as u64], data }
    }

    pub fn with_shape(shape: Vec<u64>, data: Vec<f64>) -> StoreResult<Self> {
        let expected: u64 = shape.iter().product();
        if expected != data.len() as u64 {
            return Err(StoreError::Corrupt(format!(
                "array shape {:?} does not match {} elements",
                shape,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

/// Named arrays, ordered by name.
pub type ArrayBundle = BTreeMap<String, Array>;

/// Serialize a bundle to compressed bytes.
pub fn encode_bundle(bundle: &ArrayBundle) -> StoreResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(MAGIC)?;
    encoder.write_u32::<LittleEndian>(bundle.len() as u32)?;

    for (name, array) in bundle {
        let name_bytes = name.as_bytes();
        encoder.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        encoder.write_all(name_bytes)?;

        encoder.write_u8(array.shape.len() as u8)?;
        for dim in &array.shape {
            encoder.write_u64::<LittleEndian>(*dim)?;
        }
        for value in &array.data {
            encoder.write_f64::<LittleEndian>(*value)?;
        }
    }
    Ok(encoder.finish()?)
}

/// Deserialize bytes produced by [`encode_bundle`].
pub fn decode_bundle(bytes: &[u8]) -> StoreResult<ArrayBundle> {
    let mut decoder = GzDecoder::new(bytes);

    let mut magic = [0u8; 4];
    decoder.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(StoreError::Corrupt("not an array bundle".to_string()));
    }

    let count = decoder.read_u32::<LittleEndian>()?;
    let mut bundle = ArrayBundle::new();
    for _ in 0..count {
        let name_len = decoder.read_u16::<LittleEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        decoder.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| StoreError::Corrupt("array name is not utf-8".to_string()))?;

        let ndim = decoder.read_u8()? as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(decoder.read_u64::<LittleEndian>()?);
        }

        let elements: u64 = shape.iter().product();
        let mut data = Vec::with_capacity(elements as usize);
        for _ in 0..elements {
            data.push(decoder.read_f64::<LittleEndian>()?);
        }
        bundle.insert(name, Array { shape, data });
    }
    Ok(bundle)
}
