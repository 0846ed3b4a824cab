/// Zero-based position of a node within the segmented region.
///
/// 64 bits wide so converting an index to a byte offset never overflows.
pub(crate) type NodeIndex = u64;

/// Magic value that indicates "no node".
pub(crate) const NODE_INDEX_NULL: NodeIndex = u64::MAX;

/// Number of generation bits carried by a checked handle (and by the
/// housekeeping byte).
pub(crate) const GEN_BITS: u32 = 4;

const INDEX_BITS: u32 = u32::BITS - GEN_BITS;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GEN_LO_MASK: u32 = (1 << GEN_BITS) - 1;

/// Largest index a generation-checked handle can carry. The top index is
/// reserved: a full-generation handle there would encode to all ones,
/// which is [`NodeHandle::NULL`].
pub(crate) const CHECKED_INDEX_MAX: NodeIndex = (INDEX_MASK - 1) as NodeIndex;

/// Largest index an unchecked handle can carry; one below the null value.
pub(crate) const UNCHECKED_INDEX_MAX: NodeIndex = (u32::MAX - 1) as NodeIndex;

/// External identifier of a node.
///
/// With generation checking enabled this packs the node's generation into
/// the upper [`GEN_BITS`] bits and the node index into the rest; otherwise
/// it is the raw index. Handles are an in-memory encoding only and are
/// never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle(u32);

impl NodeHandle {
    /// Distinguished handle denoting "no node".
    pub const NULL: NodeHandle = NodeHandle(u32::MAX);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub(crate) fn checked(generation: u8, index: NodeIndex) -> Self {
        debug_assert!(index <= CHECKED_INDEX_MAX);
        NodeHandle((((generation as u32) & GEN_LO_MASK) << INDEX_BITS) | (index as u32))
    }

    pub(crate) fn unchecked(index: NodeIndex) -> Self {
        debug_assert!(index <= UNCHECKED_INDEX_MAX);
        NodeHandle(index as u32)
    }

    /// Generation bits of a checked handle.
    pub(crate) fn generation(&self) -> u8 {
        (self.0 >> INDEX_BITS) as u8
    }

    /// Index bits of a checked handle.
    pub(crate) fn index_checked(&self) -> NodeIndex {
        (self.0 & INDEX_MASK) as NodeIndex
    }

    /// The whole value, for handles that carry no generation.
    pub(crate) fn index_unchecked(&self) -> NodeIndex {
        self.0 as NodeIndex
    }
}

/// Tag pattern of a node on the free list.
pub(crate) const TAG_FREE: u8 = 0x9;

/// Tag pattern of an allocated node.
pub(crate) const TAG_ALLOCATED: u8 = 0x6;

const HK_GEN_SHIFT: u32 = u8::BITS - GEN_BITS;
const HK_TAG_MASK: u8 = (1 << HK_GEN_SHIFT) - 1;
const HK_GEN_LO_MASK: u8 = (1 << GEN_BITS) - 1;

/// Packs the housekeeping byte stored inside each node: generation in the
/// high bits, tag pattern in the low bits.
pub(crate) fn pack_housekeeping(generation: u8, tag: u8) -> u8 {
    ((generation & HK_GEN_LO_MASK) << HK_GEN_SHIFT) | (tag & HK_TAG_MASK)
}

pub(crate) fn housekeeping_generation(byte: u8) -> u8 {
    byte >> HK_GEN_SHIFT
}

pub(crate) fn housekeeping_tag(byte: u8) -> u8 {
    byte & HK_TAG_MASK
}
