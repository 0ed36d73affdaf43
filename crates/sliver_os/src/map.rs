//! Parsing of the process memory map as exposed by procfs.

use core::fmt;
use core::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

/// Location of the calling process's memory map.
pub const SELF_MAPS: &str = "/proc/self/maps";

// -----------------------------------------------------------------------------
// Errors

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MapParseError {
    #[error("mapped range has invalid format")]
    InvalidRange,
    #[error("missing {0} field")]
    MissingField(&'static str),
    #[error("invalid permission character {found:?} at position {position}")]
    InvalidPermissions { position: usize, found: Option<char> },
    #[error("could not parse number")]
    ParseInt(#[from] ParseIntError),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MapLoadError {
    #[error("could not read map file")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: MapParseError,
    },
}

// -----------------------------------------------------------------------------
// Permissions

/// Access rights of a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Permissions {
    fn parse(field: &str) -> Result<Self, MapParseError> {
        let mut chars = field.chars();
        let mut flag = |position: usize, set: char, unset: char| match chars.next() {
            Some(ch) if ch == set => Ok(true),
            Some(ch) if ch == unset => Ok(false),
            found => Err(MapParseError::InvalidPermissions { position, found }),
        };

        Ok(Self {
            read: flag(0, 'r', '-')?,
            write: flag(1, 'w', '-')?,
            exec: flag(2, 'x', '-')?,
            shared: flag(3, 's', 'p')?,
        })
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.exec { 'x' } else { '-' },
            if self.shared { 's' } else { 'p' },
        )
    }
}

// -----------------------------------------------------------------------------
// RegionKind

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// The program break heap.
    Heap,
    /// The main thread stack.
    Stack,
    /// Anonymous mapping, this includes large allocations and thread stacks.
    Anon,
    /// Kernel provided pseudo mapping such as `[vdso]`.
    Special(String),
    File(PathBuf),
}

impl RegionKind {
    fn parse(field: &str) -> Self {
        match field {
            "[heap]" => Self::Heap,
            "[stack]" => Self::Stack,
            "" => Self::Anon,
            s if s.starts_with('[') && s.ends_with(']') => Self::Special(s.into()),
            path => Self::File(PathBuf::from(path)),
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap => f.write_str("[heap]"),
            Self::Stack => f.write_str("[stack]"),
            Self::Anon => Ok(()),
            Self::Special(name) => f.write_str(name),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

// -----------------------------------------------------------------------------
// MemoryRegion

/// One line of the memory map.
///
/// # Examples
///
/// ```
/// use sliver_os::{MemoryRegion, RegionKind};
///
/// let region = MemoryRegion::parse("01f0-020f rw-p 00000000 00:00 0    [heap]").unwrap();
/// assert_eq!((region.start, region.end), (0x1f0, 0x20f));
/// assert_eq!(region.kind, RegionKind::Heap);
/// assert!(region.contains(0x200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
    pub permissions: Permissions,
    pub offset: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    /// Parses `start-end perms offset dev inode [path]`.
    pub fn parse(line: &str) -> Result<Self, MapParseError> {
        let mut rest = line;
        let mut field = |name: &'static str| {
            let trimmed = rest.trim_start();
            if trimmed.is_empty() {
                return Err(MapParseError::MissingField(name));
            }
            let (value, tail) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
            rest = tail;
            Ok(value)
        };

        let (start, end) = field("range")?
            .split_once('-')
            .ok_or(MapParseError::InvalidRange)?;
        let start = usize::from_str_radix(start, 16)?;
        let end = usize::from_str_radix(end, 16)?;
        if end < start {
            return Err(MapParseError::InvalidRange);
        }

        let permissions = Permissions::parse(field("permissions")?)?;
        let offset = u64::from_str_radix(field("offset")?, 16)?;
        field("device")?;
        field("inode")?;
        let kind = RegionKind::parse(rest.trim());

        Ok(Self {
            start,
            end,
            permissions,
            offset,
            kind,
        })
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub const fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {}",
            self.start, self.end, self.permissions, self.offset, self.kind
        )
    }
}

/// Loads and parses [`SELF_MAPS`], in ascending address order.
pub fn memory_map() -> Result<Vec<MemoryRegion>, MapLoadError> {
    let text = std::fs::read_to_string(SELF_MAPS)?;
    parse_map(&text)
}

/// Parses a whole memory map, skipping blank lines.
pub fn parse_map(text: &str) -> Result<Vec<MemoryRegion>, MapLoadError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            MemoryRegion::parse(line).map_err(|source| MapLoadError::Parse {
                line: index + 1,
                source,
            })
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Tests
