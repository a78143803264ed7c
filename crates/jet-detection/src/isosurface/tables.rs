//! Compile-time lookup tables for cell faces and face edges.
//!
//! Corner `c` of cell (i, j, k) sits at grid point
//! `(i + (c & 1), j + ((c >> 1) & 1), k + (c >> 2))`:
//!
//! ```text
//!        6 ─────── 7          k
//!       ╱│        ╱│          │  j
//!      4 ─────── 5 │          │ ╱
//!      │ 2 ──────│─ 3         │╱
//!      │╱        │╱           └──── i
//!      0 ─────── 1
//! ```
//!
//! Within a face, corners are listed as `[fp0, fp1, fp2, fp3]` with local
//! coordinates fp0 = (0,0), fp1 = (1,0), fp2 = (0,1), fp3 = (1,1); the four
//! face edges are (fp0,fp1), (fp1,fp3), (fp3,fp2), (fp2,fp0).

use std::ops::BitAnd;

/// A face of a grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Face {
    Left = 0,
    Right = 1,
    Front = 2,
    Back = 3,
    Bottom = 4,
    Top = 5,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::Left,
        Face::Right,
        Face::Front,
        Face::Back,
        Face::Bottom,
        Face::Top,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn opposite(self) -> Face {
        match self {
            Face::Left => Face::Right,
            Face::Right => Face::Left,
            Face::Front => Face::Back,
            Face::Back => Face::Front,
            Face::Bottom => Face::Top,
            Face::Top => Face::Bottom,
        }
    }

    /// Cell index step (di, dj, dk) to the neighbour across this face.
    pub const fn offset(self) -> (isize, isize, isize) {
        match self {
            Face::Left => (-1, 0, 0),
            Face::Right => (1, 0, 0),
            Face::Front => (0, -1, 0),
            Face::Back => (0, 1, 0),
            Face::Bottom => (0, 0, -1),
            Face::Top => (0, 0, 1),
        }
    }

    /// Cell corners of this face in face-local order.
    pub const fn corners(self) -> [usize; 4] {
        FACE_CORNERS[self as usize]
    }

    pub const fn mask(self) -> FaceMask {
        FaceMask(1 << self as u8)
    }
}

/// Set of cell faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaceMask(u8);

impl FaceMask {
    pub const EMPTY: FaceMask = FaceMask(0);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, face: Face) -> bool {
        self.0 & (1 << face as u8) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Face> {
        Face::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl BitAnd for FaceMask {
    type Output = FaceMask;

    fn bitand(self, rhs: FaceMask) -> FaceMask {
        FaceMask(self.0 & rhs.0)
    }
}

/// Set of cut edges of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeMask(u8);

impl EdgeMask {
    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, edge: usize) -> bool {
        self.0 & (1 << edge) != 0
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// Cell corners of each face, indexed by [`Face`].
pub const FACE_CORNERS: [[usize; 4]; 6] = [
    [2, 0, 6, 4],
    [1, 3, 5, 7],
    [0, 1, 4, 5],
    [3, 2, 7, 6],
    [2, 3, 0, 1],
    [4, 5, 6, 7],
];

/// Face edges as pairs of face-local corner indices.
pub const FACE_EDGES: [(usize, usize); 4] = [(0, 1), (1, 3), (3, 2), (2, 0)];

/// Faces crossed by the isosurface, indexed by the 8-bit cube index.
pub const FACE_TABLE: [FaceMask; 256] = build_face_table();

/// Cut edges of a face, indexed by the 4-bit face-local corner code.
pub const EDGE_TABLE: [EdgeMask; 16] = build_edge_table();

/// A face is crossed iff its four corners are not all on the same side.
const fn build_face_table() -> [FaceMask; 256] {
    let mut table = [FaceMask(0); 256];
    let mut index = 0;
    while index < 256 {
        let mut mask = 0u8;
        let mut face = 0;
        while face < 6 {
            let corners = FACE_CORNERS[face];
            let mut below = 0;
            let mut n = 0;
            while n < 4 {
                below += (index >> corners[n]) & 1;
                n += 1;
            }
            if below != 0 && below != 4 {
                mask |= 1 << face;
            }
            face += 1;
        }
        table[index] = FaceMask(mask);
        index += 1;
    }
    table
}

/// An edge is cut iff its two corners are on different sides.
const fn build_edge_table() -> [EdgeMask; 16] {
    let mut table = [EdgeMask(0); 16];
    let mut code = 0;
    while code < 16 {
        let mut mask = 0u8;
        let mut edge = 0;
        while edge < 4 {
            let (p, q) = FACE_EDGES[edge];
            if ((code >> p) & 1) != ((code >> q) & 1) {
                mask |= 1 << edge;
            }
            edge += 1;
        }
        table[code] = EdgeMask(mask);
        code += 1;
    }
    table
}
