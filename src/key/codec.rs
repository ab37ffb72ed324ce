//! In-memory word layout shared with the rest of the cache.
//!
//! ```text
//! word 0   header   inode[0..20) size[20..36) cached[36] deleted[37]
//!                   csum[56] ptrs[60..63)
//! word 1   end offset
//! word 2.. one per pointer: gen[0..8) offset[8..51) dev[51..63)
//! last     checksum, only when csum is set
//! ```

use smallvec::SmallVec;

use super::{Key, Pointer, MAX_INODE, MAX_PTRS, MAX_PTR_DEV, MAX_PTR_OFFSET};
use crate::{Error, Result};

const INODE_SHIFT: u32 = 0;
const INODE_BITS: u32 = 20;
const SIZE_SHIFT: u32 = 20;
const SIZE_BITS: u32 = 16;
const CACHED_BIT: u32 = 36;
const DELETED_BIT: u32 = 37;
const CSUM_BIT: u32 = 56;
const PTRS_SHIFT: u32 = 60;
const PTRS_BITS: u32 = 3;

const GEN_SHIFT: u32 = 0;
const GEN_BITS: u32 = 8;
const OFFSET_SHIFT: u32 = 8;
const OFFSET_BITS: u32 = 43;
const DEV_SHIFT: u32 = 51;
const DEV_BITS: u32 = 12;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

#[inline]
fn field(word: u64, shift: u32, bits: u32) -> u64 {
    (word >> shift) & mask(bits)
}

#[inline]
fn put(word: &mut u64, shift: u32, bits: u32, value: u64) {
    debug_assert!(value <= mask(bits));
    *word &= !(mask(bits) << shift);
    *word |= (value & mask(bits)) << shift;
}

#[inline]
fn flag(word: u64, bit: u32) -> bool {
    field(word, bit, 1) != 0
}

/// Number of words `key` occupies once encoded.
pub fn encoded_words(key: &Key) -> usize {
    2 + key.ptrs.len() + usize::from(key.checksum.is_some())
}

fn encode_ptr(ptr: &Pointer) -> Result<u64> {
    if ptr.dev > MAX_PTR_DEV {
        return Err(Error::Invalid("pointer device id exceeds 12 bits"));
    }
    if ptr.offset > MAX_PTR_OFFSET {
        return Err(Error::Invalid("pointer offset exceeds 43 bits"));
    }
    let mut word = 0;
    put(&mut word, GEN_SHIFT, GEN_BITS, u64::from(ptr.gen));
    put(&mut word, OFFSET_SHIFT, OFFSET_BITS, ptr.offset);
    put(&mut word, DEV_SHIFT, DEV_BITS, u64::from(ptr.dev));
    Ok(word)
}

fn decode_ptr(word: u64) -> Pointer {
    Pointer {
        dev: field(word, DEV_SHIFT, DEV_BITS) as u16,
        offset: field(word, OFFSET_SHIFT, OFFSET_BITS),
        gen: field(word, GEN_SHIFT, GEN_BITS) as u8,
    }
}

/// Appends the encoding of `key` to `dst`.
pub fn encode_into(key: &Key, dst: &mut Vec<u64>) -> Result<()> {
    if key.inode > MAX_INODE {
        return Err(Error::Invalid("inode exceeds 20 bits"));
    }
    if key.ptrs.len() > MAX_PTRS {
        return Err(Error::Invalid("too many pointers"));
    }
    let mut header = 0;
    put(&mut header, INODE_SHIFT, INODE_BITS, key.inode);
    put(&mut header, SIZE_SHIFT, SIZE_BITS, u64::from(key.size));
    put(&mut header, CACHED_BIT, 1, u64::from(key.cached));
    put(&mut header, DELETED_BIT, 1, u64::from(key.deleted));
    put(&mut header, CSUM_BIT, 1, u64::from(key.checksum.is_some()));
    put(&mut header, PTRS_SHIFT, PTRS_BITS, key.ptrs.len() as u64);

    dst.reserve(encoded_words(key));
    dst.push(header);
    dst.push(key.offset);
    for ptr in &key.ptrs {
        dst.push(encode_ptr(ptr)?);
    }
    if let Some(csum) = key.checksum {
        dst.push(csum);
    }
    Ok(())
}

/// Encodes a single key.
pub fn encode(key: &Key) -> Result<Vec<u64>> {
    let mut out = Vec::with_capacity(encoded_words(key));
    encode_into(key, &mut out)?;
    Ok(out)
}

/// Decodes one key from the front of `src`, returning it with the number of
/// words consumed.
pub fn decode(src: &[u64]) -> Result<(Key, usize)> {
    let (&header, rest) = src
        .split_first()
        .ok_or(Error::Corruption("key header truncated"))?;
    let (&offset, rest) = rest
        .split_first()
        .ok_or(Error::Corruption("key offset truncated"))?;
    let nptrs = field(header, PTRS_SHIFT, PTRS_BITS) as usize;
    let has_csum = flag(header, CSUM_BIT);
    let body = nptrs + usize::from(has_csum);
    if rest.len() < body {
        return Err(Error::Corruption("key pointers truncated"));
    }
    let ptrs: SmallVec<[Pointer; 2]> = rest[..nptrs].iter().copied().map(decode_ptr).collect();
    let key = Key {
        inode: field(header, INODE_SHIFT, INODE_BITS),
        offset,
        size: field(header, SIZE_SHIFT, SIZE_BITS) as u16,
        cached: flag(header, CACHED_BIT),
        deleted: flag(header, DELETED_BIT),
        ptrs,
        checksum: has_csum.then(|| rest[nptrs]),
    };
    Ok((key, 2 + body))
}

/// Encodes a whole run back to back.
pub fn encode_run(keys: &[Key]) -> Result<Vec<u64>> {
    let words = keys.iter().map(encoded_words).sum();
    let mut out = Vec::with_capacity(words);
    for key in keys {
        encode_into(key, &mut out)?;
    }
    Ok(out)
}

/// Decodes every key in `src`.
pub fn decode_run(mut src: &[u64]) -> Result<Vec<Key>> {
    let mut keys = Vec::new();
    while !src.is_empty() {
        let (key, used) = decode(src)?;
        keys.push(key);
        src = &src[used..];
    }
    Ok(keys)
}
