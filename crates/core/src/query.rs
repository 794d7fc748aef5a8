//! Lazily-evaluated, composable entity sequences.
//!
//! A `Query` records filter/sort/paging steps and runs nothing until it is
//! enumerated. Enumeration asks the backing `QuerySource` for the collection
//! as it is *at that moment*, then applies the recorded steps in order.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::Cancellation;
use crate::error::RepositoryResult;

/// Pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of entities to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<E> {
    pub items: Vec<E>,
    /// Number of entities matching the query across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Something that can enumerate a whole collection.
#[async_trait::async_trait]
pub trait QuerySource<E>: Send + Sync {
    async fn enumerate(&self) -> RepositoryResult<Vec<E>>;
}

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type Comparator<E> = Arc<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

enum Step<E> {
    Filter(Predicate<E>),
    Sort(Comparator<E>),
    Skip(usize),
    Take(usize),
}

impl<E> Clone for Step<E> {
    fn clone(&self) -> Self {
        match self {
            Step::Filter(p) => Step::Filter(p.clone()),
            Step::Sort(c) => Step::Sort(c.clone()),
            Step::Skip(n) => Step::Skip(*n),
            Step::Take(n) => Step::Take(*n),
        }
    }
}

/// Composable, lazily-evaluated sequence of entities.
pub struct Query<E> {
    source: Arc<dyn QuerySource<E>>,
    steps: Vec<Step<E>>,
}

impl<E> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            steps: self.steps.clone(),
        }
    }
}

impl<E> core::fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Query")
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

impl<E> Query<E>
where
    E: Send + 'static,
{
    pub fn new(source: Arc<dyn QuerySource<E>>) -> Self {
        Self {
            source,
            steps: Vec::new(),
        }
    }

    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.steps.push(Step::Filter(Arc::new(predicate)));
        self
    }

    /// Stable ascending sort. A later `order_by` becomes the primary order and
    /// earlier ones break its ties.
    pub fn order_by<T, F>(mut self, key: F) -> Self
    where
        T: Ord,
        F: Fn(&E) -> T + Send + Sync + 'static,
    {
        self.steps
            .push(Step::Sort(Arc::new(move |a, b| key(a).cmp(&key(b)))));
        self
    }

    pub fn order_by_desc<T, F>(mut self, key: F) -> Self
    where
        T: Ord,
        F: Fn(&E) -> T + Send + Sync + 'static,
    {
        self.steps
            .push(Step::Sort(Arc::new(move |a, b| key(b).cmp(&key(a)))));
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.steps.push(Step::Skip(n));
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.steps.push(Step::Take(n));
        self
    }

    /// Enumerate the source and apply every recorded step.
    pub async fn to_vec(self, cancel: &Cancellation) -> RepositoryResult<Vec<E>> {
        let items = cancel.run(self.source.enumerate()).await?;
        Ok(apply_steps(items, &self.steps))
    }

    pub async fn first(self, cancel: &Cancellation) -> RepositoryResult<Option<E>> {
        Ok(self.take(1).to_vec(cancel).await?.into_iter().next())
    }

    pub async fn count(self, cancel: &Cancellation) -> RepositoryResult<usize> {
        Ok(self.to_vec(cancel).await?.len())
    }

    pub async fn any(self, cancel: &Cancellation) -> RepositoryResult<bool> {
        Ok(self.first(cancel).await?.is_some())
    }

    /// Enumerate one page. `total` counts every match before paging.
    pub async fn page(self, pagination: Pagination, cancel: &Cancellation) -> RepositoryResult<Page<E>> {
        let all = self.to_vec(cancel).await?;
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);

        Ok(Page {
            items,
            total,
            pagination,
            has_more,
        })
    }
}

fn apply_steps<E>(mut items: Vec<E>, steps: &[Step<E>]) -> Vec<E> {
    for step in steps {
        match step {
            Step::Filter(predicate) => items.retain(|e| predicate(e)),
            Step::Sort(compare) => items.sort_by(|a, b| compare(a, b)),
            Step::Skip(n) => {
                let n = (*n).min(items.len());
                items.drain(..n);
            }
            Step::Take(n) => items.truncate(*n),
        }
    }
    items
}
