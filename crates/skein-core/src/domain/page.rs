//! Paging and search criteria for store reads.

use crate::domain::update::RecordField;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortCriteria {
    pub field: RecordField,
    pub direction: SortDirection,
}

impl SortCriteria {
    pub fn asc(field: RecordField) -> Self {
        Self {
            field,
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: RecordField) -> Self {
        Self {
            field,
            direction: SortDirection::Desc,
        }
    }
}

/// PageRequest: `limit == 0` はページ無制限
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
    pub sort: Vec<SortCriteria>,
}

impl PageRequest {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit,
            sort: Vec::new(),
        }
    }

    pub fn sorted_by(mut self, criteria: SortCriteria) -> Self {
        self.sort.push(criteria);
        self
    }

    /// Slices an already sorted result set.
    pub fn window<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        if self.limit == 0 {
            iter.collect()
        } else {
            iter.take(self.limit).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult<T> {
    pub page: PageRequest,
    pub results: Vec<T>,
}

impl<T> PageResult<T> {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}

/// Half-open interval `[from, to)`; a missing bound is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateInterval {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateInterval {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, ts: Option<DateTime<Utc>>) -> bool {
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(ts) = ts else {
            return false;
        };
        self.from.is_none_or(|from| ts >= from) && self.to.is_none_or(|to| ts < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_applies_offset_and_limit() {
        let items: Vec<u32> = (0..10).collect();
        let page = PageRequest {
            offset: 3,
            limit: 4,
            sort: Vec::new(),
        };
        assert_eq!(page.window(items.clone()), vec![3, 4, 5, 6]);
        assert_eq!(PageRequest::unbounded().window(items).len(), 10);
    }

    #[test]
    fn interval_is_half_open() {
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        let interval = DateInterval::between(t(1), t(3));

        assert!(!interval.contains(Some(t(0))));
        assert!(interval.contains(Some(t(1))));
        assert!(interval.contains(Some(t(2))));
        assert!(!interval.contains(Some(t(3))));
        assert!(!interval.contains(None));
        assert!(DateInterval::any().contains(None));
    }
}
