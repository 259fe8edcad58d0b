use std::fmt;
use strum_macros::EnumIter;

/// The life cycle tag of a heap region.
///
/// The tags are bit encoded so that the commonly polled groups (young,
/// humongous, pinned, old) are single mask tests:
///
/// ```text
/// free                0_0000
/// eden                0_0010   young
/// survivor            0_0011   young
/// starts humongous    0_1100   humongous, pinned
/// continues humongous 0_1101   humongous, pinned
/// old                 1_0000   old
/// archive             1_1000   old, pinned
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, EnumIter)]
pub enum RegionKind {
    /// the region is unused and may be handed out by the allocator.
    Free,
    /// the region holds newly allocated objects.
    Eden,
    /// the region holds objects that survived their first collection.
    Survivor,
    /// the first region of a humongous object span.
    StartsHumongous,
    /// a later region of a humongous object span.
    ContinuesHumongous,
    /// the region holds promoted (tenured) objects.
    Old,
    /// the region holds immutable pre-built content and is never collected.
    Archive,
}

impl RegionKind {
    const TAG_FREE: u8 = 0;

    const TAG_YOUNG_MASK: u8 = 2;
    const TAG_EDEN: u8 = Self::TAG_YOUNG_MASK;
    const TAG_SURVIVOR: u8 = Self::TAG_YOUNG_MASK + 1;

    const TAG_HUMONGOUS_MASK: u8 = 4;
    const TAG_PINNED_MASK: u8 = 8;
    const TAG_STARTS_HUMONGOUS: u8 = Self::TAG_HUMONGOUS_MASK | Self::TAG_PINNED_MASK;
    const TAG_CONTINUES_HUMONGOUS: u8 = Self::TAG_STARTS_HUMONGOUS + 1;

    const TAG_OLD_MASK: u8 = 16;
    const TAG_OLD: u8 = Self::TAG_OLD_MASK;
    const TAG_ARCHIVE: u8 = Self::TAG_PINNED_MASK | Self::TAG_OLD_MASK;

    /// The raw tag byte for this kind.
    pub const fn tag(self) -> u8 {
        match self {
            RegionKind::Free => Self::TAG_FREE,
            RegionKind::Eden => Self::TAG_EDEN,
            RegionKind::Survivor => Self::TAG_SURVIVOR,
            RegionKind::StartsHumongous => Self::TAG_STARTS_HUMONGOUS,
            RegionKind::ContinuesHumongous => Self::TAG_CONTINUES_HUMONGOUS,
            RegionKind::Old => Self::TAG_OLD,
            RegionKind::Archive => Self::TAG_ARCHIVE,
        }
    }

    /// Decode a tag byte. Returns `None` for any bit pattern outside the
    /// closed set of seven tags.
    pub const fn from_tag(tag: u8) -> Option<RegionKind> {
        match tag {
            Self::TAG_FREE => Some(RegionKind::Free),
            Self::TAG_EDEN => Some(RegionKind::Eden),
            Self::TAG_SURVIVOR => Some(RegionKind::Survivor),
            Self::TAG_STARTS_HUMONGOUS => Some(RegionKind::StartsHumongous),
            Self::TAG_CONTINUES_HUMONGOUS => Some(RegionKind::ContinuesHumongous),
            Self::TAG_OLD => Some(RegionKind::Old),
            Self::TAG_ARCHIVE => Some(RegionKind::Archive),
            _ => None,
        }
    }

    pub const fn is_free(self) -> bool {
        matches!(self, RegionKind::Free)
    }

    pub const fn is_young(self) -> bool {
        self.tag() & Self::TAG_YOUNG_MASK != 0
    }

    pub const fn is_eden(self) -> bool {
        matches!(self, RegionKind::Eden)
    }

    pub const fn is_survivor(self) -> bool {
        matches!(self, RegionKind::Survivor)
    }

    pub const fn is_humongous(self) -> bool {
        self.tag() & Self::TAG_HUMONGOUS_MASK != 0
    }

    pub const fn is_starts_humongous(self) -> bool {
        matches!(self, RegionKind::StartsHumongous)
    }

    pub const fn is_continues_humongous(self) -> bool {
        matches!(self, RegionKind::ContinuesHumongous)
    }

    /// Pinned regions are never moved by a collection.
    pub const fn is_pinned(self) -> bool {
        self.tag() & Self::TAG_PINNED_MASK != 0
    }

    pub const fn is_old(self) -> bool {
        self.tag() & Self::TAG_OLD_MASK != 0
    }

    pub const fn is_archive(self) -> bool {
        matches!(self, RegionKind::Archive)
    }

    /// The display name of the tag.
    pub const fn name(self) -> &'static str {
        match self {
            RegionKind::Free => "FREE",
            RegionKind::Eden => "EDEN",
            RegionKind::Survivor => "SURV",
            RegionKind::StartsHumongous => "HUMS",
            RegionKind::ContinuesHumongous => "HUMC",
            RegionKind::Old => "OLD",
            RegionKind::Archive => "ARC",
        }
    }

    /// A one or two character name for dense region maps.
    pub const fn short_name(self) -> &'static str {
        match self {
            RegionKind::Free => "F",
            RegionKind::Eden => "E",
            RegionKind::Survivor => "S",
            RegionKind::StartsHumongous => "HS",
            RegionKind::ContinuesHumongous => "HC",
            RegionKind::Old => "O",
            RegionKind::Archive => "A",
        }
    }

    /// Whether a region tag may move from `self` to `to`.
    ///
    /// Becoming `Old` (promotion) and becoming `Free` (reclaim) are legal from
    /// any tag. Everything else requires a specific prior tag: a free region
    /// can take any allocation role, and a survivor region can be re-tagged
    /// eden at the start of the next collection.
    pub fn can_transition_to(self, to: RegionKind) -> bool {
        use RegionKind::*;
        matches!(
            (self, to),
            (_, Old)
                | (_, Free)
                | (Free, Eden)
                | (Free, Survivor)
                | (Free, StartsHumongous)
                | (Free, ContinuesHumongous)
                | (Free, Archive)
                | (Survivor, Eden)
        )
    }

    /// Check a tag transition, returning the new tag on success.
    pub fn transition(self, to: RegionKind) -> Result<RegionKind, TransitionError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

impl From<RegionKind> for u8 {
    fn from(kind: RegionKind) -> Self {
        kind.tag()
    }
}

impl From<u8> for RegionKind {
    fn from(tag: u8) -> Self {
        match RegionKind::from_tag(tag) {
            Some(kind) => kind,
            // A stored tag is only ever written from a RegionKind. Anything
            // else means the region table is corrupted.
            None => unreachable!("invalid region tag: {:#04x}", tag),
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A region tag transition that is not part of the legal life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RegionKind,
    pub to: RegionKind,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "illegal region tag transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}
