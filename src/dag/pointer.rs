use std::fmt;

use crate::dag::vbr::RGB8Color;

/// Word address of a geometry node, with two out-of-band sentinels: `NULL`
/// (empty subtree) and `FILLED` (fully occupied subtree). Sentinels are never
/// stored in the pool; a `FILLED` pointer at any level is equivalent to a
/// node whose children are all `FILLED`, down to an all-ones leaf.
///
/// Because nodes are hash-consed, two pointers are equal if and only if they
/// denote structurally identical subtrees.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodePointer(u32);

impl NodePointer {
    pub const NULL: NodePointer = NodePointer(u32::MAX);
    pub const FILLED: NodePointer = NodePointer(u32::MAX - 1);
    /// Largest storable word address.
    pub const MAX_ADDRESS: u32 = u32::MAX - 2;

    #[inline]
    pub fn address(addr: u32) -> Self {
        debug_assert!(addr <= Self::MAX_ADDRESS);
        NodePointer(addr)
    }

    /// Reconstructs a pointer from its stored word form.
    #[inline]
    pub fn from_word(word: u32) -> Self {
        NodePointer(word)
    }

    #[inline]
    pub fn to_word(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub fn is_filled(self) -> bool {
        self.0 == u32::MAX - 1
    }

    #[inline]
    pub fn addr(self) -> Option<u32> {
        if self.0 <= Self::MAX_ADDRESS {
            Some(self.0)
        } else {
            None
        }
    }
}

impl fmt::Debug for NodePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NodePointer::NULL")
        } else if self.is_filled() {
            write!(f, "NodePointer::FILLED")
        } else {
            write!(f, "NodePointer({})", self.0)
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColorTag {
    /// No color stored for this subtree.
    Null,
    /// Every voxel of the subtree shares the color in the payload.
    Solid,
    /// Payload indexes an 8-child node in the color pool's node store.
    Node,
    /// Payload is a word address of a VBR leaf slot in the leaf store.
    Leaf,
}

/// Tagged pointer into the color octree: a 2-bit tag and a 30-bit payload.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ColorPointer(u32);

impl ColorPointer {
    pub const NULL: ColorPointer = ColorPointer(0);
    /// Largest payload value.
    pub const MAX_DATA: u32 = (1 << 30) - 1;

    const TAG_SHIFT: u32 = 30;

    #[inline]
    fn pack(tag: u32, data: u32) -> Self {
        debug_assert!(data <= Self::MAX_DATA);
        ColorPointer((tag << Self::TAG_SHIFT) | data)
    }

    #[inline]
    pub fn solid(color: RGB8Color) -> Self {
        Self::pack(1, color.0)
    }

    #[inline]
    pub fn node(index: u32) -> Self {
        Self::pack(2, index)
    }

    #[inline]
    pub fn leaf(addr: u32) -> Self {
        Self::pack(3, addr)
    }

    #[inline]
    pub fn from_word(word: u32) -> Self {
        ColorPointer(word)
    }

    #[inline]
    pub fn to_word(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn tag(self) -> ColorTag {
        match self.0 >> Self::TAG_SHIFT {
            0 => ColorTag::Null,
            1 => ColorTag::Solid,
            2 => ColorTag::Node,
            _ => ColorTag::Leaf,
        }
    }

    #[inline]
    pub fn data(self) -> u32 {
        self.0 & Self::MAX_DATA
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.tag() == ColorTag::Null
    }

    /// The solid color, if this is a `Solid` pointer.
    #[inline]
    pub fn solid_color(self) -> Option<RGB8Color> {
        match self.tag() {
            ColorTag::Solid => Some(RGB8Color(self.data())),
            _ => None,
        }
    }
}

impl fmt::Debug for ColorPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            ColorTag::Null => write!(f, "ColorPointer::NULL"),
            ColorTag::Solid => write!(f, "ColorPointer::Solid({:#08x})", self.data()),
            ColorTag::Node => write!(f, "ColorPointer::Node({})", self.data()),
            ColorTag::Leaf => write!(f, "ColorPointer::Leaf({})", self.data()),
        }
    }
}
