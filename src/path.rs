use std::fmt;

use crate::{Error, Result};

/// Identifier of a path within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub usize);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A group of streams connecting to one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Remote endpoint the path was created for.
    pub remote: String,
    /// Stream indices, in worker order.
    pub streams: Vec<usize>,
}

impl Path {
    /// Number of streams in the path.
    pub fn width(&self) -> usize {
        self.streams.len()
    }
}

#[derive(Debug)]
pub(crate) struct PathTable {
    slots: Vec<Option<Path>>,
    max: usize,
}

impl PathTable {
    pub(crate) fn new(max: usize) -> Self {
        PathTable { slots: Vec::new(), max }
    }

    pub(crate) fn set_max(&mut self, max: usize) {
        self.max = max;
    }

    /// Stores `path` in the first free slot, growing the table if needed.
    pub(crate) fn insert(&mut self, path: Path) -> Result<PathId> {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = Some(path);
            return Ok(PathId(free));
        }
        if self.slots.len() >= self.max {
            log::error!("Trying to create more than {} paths", self.max);
            return Err(Error::PathSpaceExhausted { max: self.max });
        }
        self.slots.push(Some(path));
        Ok(PathId(self.slots.len() - 1))
    }

    /// Whether another path fits.
    pub(crate) fn has_room(&self) -> bool {
        self.slots.iter().any(Option::is_none) || self.slots.len() < self.max
    }

    pub(crate) fn remove(&mut self, id: PathId) -> Result<Path> {
        let path = self.slots.get_mut(id.0).and_then(Option::take).ok_or(Error::UnknownPath(id))?;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Ok(path)
    }

    pub(crate) fn get(&self, id: PathId) -> Result<&Path> {
        self.slots.get(id.0).and_then(Option::as_ref).ok_or(Error::UnknownPath(id))
    }

    pub(crate) fn ids(&self) -> Vec<PathId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| PathId(i))
            .collect()
    }

    /// Width of the widest live path.
    pub(crate) fn widest(&self) -> usize {
        self.slots.iter().flatten().map(Path::width).max().unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
