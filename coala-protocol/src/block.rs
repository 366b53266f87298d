//! Block option value
//!
//! A block is one fragment of a multi-datagram payload. Its control value
//! packs the block number, the more-coming flag and the size class into a
//! single integer: `number << 4 | more << 3 | size_class`.

use bytes::Bytes;
use thiserror::Error;

/// Mask for the size class bits
const SIZE_MASK: u32 = 0b111;

/// More-coming flag
const MORE_FLAG: u32 = 1 << 3;

/// Block size class (16 to 1024 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlockSize {
    S16 = 0,
    S32 = 1,
    S64 = 2,
    S128 = 3,
    S256 = 4,
    S512 = 5,
    S1024 = 6,
}

impl BlockSize {
    /// All size classes, smallest first
    pub const ALL: [BlockSize; 7] = [
        BlockSize::S16,
        BlockSize::S32,
        BlockSize::S64,
        BlockSize::S128,
        BlockSize::S256,
        BlockSize::S512,
        BlockSize::S1024,
    ];

    pub fn from_index(index: u8) -> Option<Self> {
        BlockSize::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Size in bytes
    pub fn bytes(self) -> usize {
        16 << self.index()
    }

    /// Size class describing a slice of `len` bytes
    ///
    /// Lengths of 1024 and above map to 1024, lengths of 16 and below map to
    /// 16, anything in between takes the class of its highest set bit.
    pub fn for_len(len: usize) -> Self {
        if len >= 1024 {
            return BlockSize::S1024;
        }
        if len <= 16 {
            return BlockSize::S16;
        }
        let highest_bit = usize::BITS - 1 - len.leading_zeros();
        BlockSize::from_index((highest_bit - 4) as u8).unwrap_or(BlockSize::S1024)
    }
}

/// One fragment with its control value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    number: u32,
    more: bool,
    size: BlockSize,
    data: Bytes,
}

impl Block {
    /// Create a block, deriving the size class from the data length
    pub fn new(number: u32, data: Bytes, more: bool) -> Self {
        let size = BlockSize::for_len(data.len());
        Block {
            number,
            more,
            size,
            data,
        }
    }

    /// Create a block with an explicit size class
    pub fn with_size(number: u32, more: bool, size: BlockSize, data: Bytes) -> Self {
        Block {
            number,
            more,
            size,
            data,
        }
    }

    /// Unpack a control value and attach `data`
    pub fn from_raw(value: u32, data: Bytes) -> Result<Self, BlockError> {
        let index = (value & SIZE_MASK) as u8;
        let size = BlockSize::from_index(index).ok_or(BlockError::InvalidSizeClass(index))?;
        Ok(Block {
            number: value >> 4,
            more: value & MORE_FLAG != 0,
            size,
            data,
        })
    }

    /// Packed control value
    pub fn to_raw(&self) -> u32 {
        let more = if self.more { MORE_FLAG } else { 0 };
        (self.number << 4) | more | self.size.index() as u32
    }

    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline]
    pub fn is_more_coming(&self) -> bool {
        self.more
    }

    #[inline]
    pub fn size(&self) -> BlockSize {
        self.size
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// Block decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid block size class: {0}")]
    InvalidSizeClass(u8),

    #[error("Block option value out of range: {0}")]
    OutOfRange(u64),
}
