use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

/// One of the four base dimensions of a usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    User,
    Vo,
    Machine,
    Status,
}

impl Dimension {
    /// Column name used for this dimension in every aggregate table.
    pub const fn column(self) -> &'static str {
        match self {
            Self::User => "global_user_name",
            Self::Vo => "vo_name",
            Self::Machine => "machine_name",
            Self::Status => "status",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Vo => "vo",
            Self::Machine => "machine",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use Dimension::{Machine, Status, User, Vo};

/// Symbolic identifier of one aggregate, defined by the dimensions it retains.
///
/// The digits follow the derivation path through the lattice: `key_0` keeps
/// all four dimensions, `key_0X` drops one, `key_0XY` drops two and
/// `key_0XY1` keeps a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AggregateKey {
    Key0,
    Key01,
    Key02,
    Key03,
    Key04,
    Key011,
    Key012,
    Key021,
    Key031,
    Key032,
    Key041,
    Key0211,
    Key0311,
    Key0321,
    Key0411,
}

impl AggregateKey {
    /// All keys, most granular first.
    pub const ALL: [AggregateKey; 15] = [
        Self::Key0,
        Self::Key01,
        Self::Key02,
        Self::Key03,
        Self::Key04,
        Self::Key011,
        Self::Key012,
        Self::Key021,
        Self::Key031,
        Self::Key032,
        Self::Key041,
        Self::Key0211,
        Self::Key0311,
        Self::Key0321,
        Self::Key0411,
    ];

    /// The maximal key, fed directly from raw records.
    pub const ROOT: AggregateKey = Self::Key0;

    pub const fn name(self) -> &'static str {
        match self {
            Self::Key0 => "key_0",
            Self::Key01 => "key_01",
            Self::Key02 => "key_02",
            Self::Key03 => "key_03",
            Self::Key04 => "key_04",
            Self::Key011 => "key_011",
            Self::Key012 => "key_012",
            Self::Key021 => "key_021",
            Self::Key031 => "key_031",
            Self::Key032 => "key_032",
            Self::Key041 => "key_041",
            Self::Key0211 => "key_0211",
            Self::Key0311 => "key_0311",
            Self::Key0321 => "key_0321",
            Self::Key0411 => "key_0411",
        }
    }

    /// Storage table holding this key's rows.
    pub const fn table(self) -> &'static str {
        match self {
            Self::Key0 => "user_vo_machine_status",
            Self::Key01 => "user_vo_machine",
            Self::Key02 => "user_vo_status",
            Self::Key03 => "vo_machine_status",
            Self::Key04 => "user_machine_status",
            Self::Key011 => "user_vo",
            Self::Key012 => "user_machine",
            Self::Key021 => "user_status",
            Self::Key031 => "vo_status",
            Self::Key032 => "vo_machine",
            Self::Key041 => "machine_status",
            Self::Key0211 => "user",
            Self::Key0311 => "status",
            Self::Key0321 => "vo",
            Self::Key0411 => "machine",
        }
    }

    /// Retained dimensions, in storage column order.
    pub const fn dimensions(self) -> &'static [Dimension] {
        match self {
            Self::Key0 => &[User, Vo, Machine, Status],
            Self::Key01 => &[User, Vo, Machine],
            Self::Key02 => &[User, Vo, Status],
            Self::Key03 => &[Vo, Machine, Status],
            Self::Key04 => &[User, Machine, Status],
            Self::Key011 => &[User, Vo],
            Self::Key012 => &[User, Machine],
            Self::Key021 => &[User, Status],
            Self::Key031 => &[Vo, Status],
            Self::Key032 => &[Vo, Machine],
            Self::Key041 => &[Machine, Status],
            Self::Key0211 => &[User],
            Self::Key0311 => &[Status],
            Self::Key0321 => &[Vo],
            Self::Key0411 => &[Machine],
        }
    }

    pub fn retains(self, dim: Dimension) -> bool {
        self.dimensions().contains(&dim)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.name() == name)
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A "drop one dimension" step from `parent` to `child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub parent: AggregateKey,
    pub child: AggregateKey,
}

impl Edge {
    pub const fn new(parent: AggregateKey, child: AggregateKey) -> Self {
        Self { parent, child }
    }

    /// Returns the dimension the child drops, or `None` if the child is not
    /// the parent minus exactly one dimension.
    pub fn dropped(&self) -> Option<Dimension> {
        let parent = self.parent.dimensions();
        let child = self.child.dimensions();

        if parent.len() != child.len() + 1 {
            return None;
        }
        if !child.iter().all(|d| parent.contains(d)) {
            return None;
        }

        parent.iter().copied().find(|d| !child.contains(d))
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.parent, self.child)
    }
}

use AggregateKey::*;

/// Reduction edges in dependency order: every parent is produced before it
/// is read.
pub const REDUCTION_ORDER: [Edge; 14] = [
    Edge::new(Key0, Key01),
    Edge::new(Key0, Key02),
    Edge::new(Key0, Key03),
    Edge::new(Key0, Key04),
    Edge::new(Key01, Key011),
    Edge::new(Key01, Key012),
    Edge::new(Key02, Key021),
    Edge::new(Key03, Key031),
    Edge::new(Key03, Key032),
    Edge::new(Key04, Key041),
    Edge::new(Key021, Key0211),
    Edge::new(Key031, Key0311),
    Edge::new(Key032, Key0321),
    Edge::new(Key041, Key0411),
];

/// Returns true if `child` is scheduled as a direct reduction of `parent`.
pub fn is_reduction_edge(parent: AggregateKey, child: AggregateKey) -> bool {
    REDUCTION_ORDER
        .iter()
        .any(|edge| edge.parent == parent && edge.child == child)
}

/// Errors found while validating a reduction schedule.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LatticeError {
    #[error("edge {edge} does not drop exactly one dimension")]
    NotSingleDrop { edge: Edge },

    #[error("edge {edge} reads {parent} before it has been produced")]
    ParentNotReady { edge: Edge, parent: AggregateKey },

    #[error("{key} is produced more than once")]
    DuplicateChild { key: AggregateKey },

    #[error("{key} is never produced")]
    Unreachable { key: AggregateKey },
}

/// Checks that `edges` is a complete topological schedule of the lattice.
pub fn validate_reduction_order(edges: &[Edge]) -> Result<(), LatticeError> {
    let mut produced = HashSet::with_capacity(AggregateKey::ALL.len());
    produced.insert(AggregateKey::ROOT);

    for edge in edges {
        if edge.dropped().is_none() {
            return Err(LatticeError::NotSingleDrop { edge: *edge });
        }
        if !produced.contains(&edge.parent) {
            return Err(LatticeError::ParentNotReady {
                edge: *edge,
                parent: edge.parent,
            });
        }
        if !produced.insert(edge.child) {
            return Err(LatticeError::DuplicateChild { key: edge.child });
        }
    }

    for key in AggregateKey::ALL {
        if !produced.contains(&key) {
            return Err(LatticeError::Unreachable { key });
        }
    }

    Ok(())
}
