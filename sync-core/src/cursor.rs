//! Pagination cursor tracking for chatsync.
//!
//! A [`PaginationCursorTracker`] remembers the oldest and newest item ids
//! loaded for one paginated query, so the next request knows where to
//! continue. Every page load is bracketed by [`begin`] and [`end`]; an
//! `end` whose parameter does not match the bracket opened by `begin` is
//! rejected and leaves the tracker untouched.
//!
//! One tracker belongs to one query. Trackers are never shared between
//! queries.
//!
//! [`begin`]: PaginationCursorTracker::begin
//! [`end`]: PaginationCursorTracker::end

use std::fmt::Debug;
use thiserror::Error;

/// Where a page starts, relative to an item id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationParameter<K> {
    /// Items older than the id.
    LessThan(K),
    /// The id and older items.
    LessThanOrEqual(K),
    /// Items newer than the id.
    GreaterThan(K),
    /// The id and newer items.
    GreaterThanOrEqual(K),
    /// A page centered on the id.
    Around(K),
}

impl<K> PaginationParameter<K> {
    /// The page extends towards older items.
    pub fn is_older(&self) -> bool {
        matches!(self, Self::LessThan(_) | Self::LessThanOrEqual(_))
    }

    /// The page extends towards newer items.
    pub fn is_newer(&self) -> bool {
        matches!(self, Self::GreaterThan(_) | Self::GreaterThanOrEqual(_))
    }

    /// The id the page is anchored on.
    pub fn anchor(&self) -> &K {
        match self {
            Self::LessThan(k)
            | Self::LessThanOrEqual(k)
            | Self::GreaterThan(k)
            | Self::GreaterThanOrEqual(k)
            | Self::Around(k) => k,
        }
    }
}

/// A loaded page of item ids, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<K> {
    /// Item ids, oldest first.
    pub items: Vec<K>,
    /// Page size that was requested.
    pub requested: usize,
}

impl<K> Page<K> {
    /// Create a page.
    pub fn new(items: Vec<K>, requested: usize) -> Self {
        Self { items, requested }
    }

    /// Fewer items came back than were asked for.
    pub fn is_last(&self) -> bool {
        self.items.len() < self.requested
    }
}

/// How a loaded page combines with what is already loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMerge {
    /// Page replaces everything (first page, or jump to an item).
    Replace,
    /// Page goes before the oldest loaded item.
    PrependOlder,
    /// Page goes after the newest loaded item.
    AppendNewer,
}

/// Errors from the cursor tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// `end` was called with a parameter other than the one in progress.
    #[error("pagination bracket mismatch: expected {expected}, got {actual}")]
    Mismatch {
        /// Parameter recorded by `begin`.
        expected: String,
        /// Parameter passed to `end`.
        actual: String,
    },
}

/// Tracks the loaded range of one paginated query.
#[derive(Debug, Clone)]
pub struct PaginationCursorTracker<K> {
    oldest: Option<K>,
    newest: Option<K>,
    in_progress: Option<PaginationParameter<K>>,
    has_loaded_all_older: bool,
    has_loaded_all_newer: bool,
}

impl<K: Clone + PartialEq + Debug> PaginationCursorTracker<K> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            oldest: None,
            newest: None,
            in_progress: None,
            has_loaded_all_older: false,
            has_loaded_all_newer: false,
        }
    }

    /// Open a bracket for a page load.
    ///
    /// `None` loads the first (newest) page and clears any bracket in
    /// progress.
    pub fn begin(&mut self, parameter: Option<PaginationParameter<K>>) {
        self.in_progress = parameter;
    }

    /// Close the bracket for a page load.
    ///
    /// Returns how the page merges with loaded content, or `None` when the
    /// load failed. A parameter that differs from the one given to
    /// [`begin`](Self::begin) yields [`CursorError::Mismatch`] and changes
    /// nothing.
    pub fn end<E>(
        &mut self,
        parameter: Option<&PaginationParameter<K>>,
        result: &Result<Page<K>, E>,
    ) -> Result<Option<PageMerge>, CursorError> {
        if self.in_progress.as_ref() != parameter {
            return Err(CursorError::Mismatch {
                expected: format!("{:?}", self.in_progress),
                actual: format!("{parameter:?}"),
            });
        }
        self.in_progress = None;

        let Ok(page) = result else {
            return Ok(None);
        };

        let merge = match parameter {
            None => {
                self.replace(page);
                self.has_loaded_all_newer = true;
                PageMerge::Replace
            }
            Some(PaginationParameter::Around(_)) => {
                self.replace(page);
                self.has_loaded_all_newer = false;
                PageMerge::Replace
            }
            Some(p) if p.is_older() => {
                if let Some(first) = page.items.first() {
                    self.oldest = Some(first.clone());
                }
                self.has_loaded_all_older = page.is_last();
                PageMerge::PrependOlder
            }
            Some(_) => {
                if let Some(last) = page.items.last() {
                    self.newest = Some(last.clone());
                }
                self.has_loaded_all_newer = page.is_last();
                PageMerge::AppendNewer
            }
        };
        Ok(Some(merge))
    }

    fn replace(&mut self, page: &Page<K>) {
        self.oldest = page.items.first().cloned();
        self.newest = page.items.last().cloned();
        self.has_loaded_all_older = page.is_last();
    }

    /// Oldest loaded item id.
    pub fn oldest(&self) -> Option<&K> {
        self.oldest.as_ref()
    }

    /// Newest loaded item id.
    pub fn newest(&self) -> Option<&K> {
        self.newest.as_ref()
    }

    /// A page load is in progress.
    pub fn is_loading(&self) -> bool {
        self.in_progress.is_some()
    }

    /// Nothing older is left to load.
    pub fn has_loaded_all_older(&self) -> bool {
        self.has_loaded_all_older
    }

    /// Nothing newer is left to load.
    pub fn has_loaded_all_newer(&self) -> bool {
        self.has_loaded_all_newer
    }

    /// Parameter for the next older page.
    pub fn next_older(&self) -> Option<PaginationParameter<K>> {
        self.oldest.clone().map(PaginationParameter::LessThan)
    }

    /// Parameter for the next newer page.
    pub fn next_newer(&self) -> Option<PaginationParameter<K>> {
        self.newest.clone().map(PaginationParameter::GreaterThan)
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl<K: Clone + PartialEq + Debug> Default for PaginationCursorTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}
