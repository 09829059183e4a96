//! The "collect N replies, combine, fire once" primitive.
//!
//! Every conductor phase waits for replies through an [`Aggregate`]. It is
//! created with the number of contributions it expects (optionally the exact
//! set of senders), folds each reply into an accumulator with the payload's
//! merge operation and hands the combined value out exactly once, after the
//! last expected contribution.

use crate::message::WorkerId;

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Commutative, associative combination of two partial results. The
/// `Default` value of an implementor must be its identity.
pub trait Merge {
    fn merge(&mut self, other: Self);
}

impl Merge for () {
    fn merge(&mut self, _other: Self) {}
}

type MergeFn<T> = Box<dyn Fn(&mut T, T) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("duplicate contribution from {0}")]
    Duplicate(WorkerId),

    #[error("unexpected contribution from {0}")]
    Unexpected(WorkerId),

    #[error("aggregate already fired")]
    AlreadyComplete,
}

pub struct Aggregate<T> {
    expected: usize,
    senders: Option<BTreeSet<WorkerId>>,
    contributors: BTreeSet<WorkerId>,
    value: Option<T>,
    merge: MergeFn<T>,
}

impl<T> Aggregate<T>
where
    T: Merge + Default + 'static,
{
    /// Waits for `expected` contributions from distinct senders.
    pub fn new(expected: usize) -> Self {
        Self::with_merge(expected, |acc: &mut T, other: T| acc.merge(other))
    }

    /// Waits for exactly one contribution from each of `senders`.
    pub fn for_senders<I>(senders: I) -> Self
    where
        I: IntoIterator<Item = WorkerId>,
    {
        let mut aggregate = Self::new(0);
        aggregate.restrict(senders);
        aggregate
    }
}

impl<T> Aggregate<T>
where
    T: Default + 'static,
{
    /// Like [`Aggregate::new`], but folds with `merge` instead of the
    /// payload's own [`Merge`] impl.
    pub fn with_merge<F>(expected: usize, merge: F) -> Self
    where
        F: Fn(&mut T, T) + Send + Sync + 'static,
    {
        Aggregate {
            expected,
            senders: None,
            contributors: BTreeSet::new(),
            value: Some(T::default()),
            merge: Box::new(merge),
        }
    }

    /// Restricts the aggregate to `senders`, one contribution each.
    pub fn restrict<I>(&mut self, senders: I)
    where
        I: IntoIterator<Item = WorkerId>,
    {
        let senders: BTreeSet<WorkerId> = senders.into_iter().collect();
        self.expected = senders.len();
        self.senders = Some(senders);
    }

    /// Folds in one contribution. Returns the combined value if and only if
    /// this contribution was the last one expected.
    pub fn contribute(
        &mut self,
        sender: WorkerId,
        value: T,
    ) -> Result<Option<T>, AggregateError> {
        if self.value.is_none() {
            return Err(AggregateError::AlreadyComplete);
        }
        if let Some(senders) = &self.senders {
            if !senders.contains(&sender) {
                return Err(AggregateError::Unexpected(sender));
            }
        }
        if self.contributors.contains(&sender) {
            return Err(AggregateError::Duplicate(sender));
        }
        if self.contributors.len() >= self.expected {
            return Err(AggregateError::Unexpected(sender));
        }

        self.contributors.insert(sender);
        if let Some(acc) = self.value.as_mut() {
            (self.merge)(acc, value);
        }

        Ok(self.fire_if_complete())
    }

    /// Hands out the combined value if every expected contribution arrived
    /// and it has not been handed out yet. An aggregate expecting nothing
    /// fires on the first call.
    pub fn fire_if_complete(&mut self) -> Option<T> {
        if self.contributors.len() >= self.expected {
            self.value.take()
        } else {
            None
        }
    }

    /// Hands out whatever was combined so far, complete or not. Used for
    /// best-effort results after a deadline; the aggregate is spent after.
    pub fn take_partial(&mut self) -> Option<T> {
        self.value.take()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.contributors.len()
    }

    pub fn has_fired(&self) -> bool {
        self.value.is_none()
    }

    pub fn contributed(&self, sender: &WorkerId) -> bool {
        self.contributors.contains(sender)
    }

    /// Expected senders that have not contributed yet. Empty for
    /// count-only aggregates.
    pub fn missing(&self) -> Vec<WorkerId> {
        match &self.senders {
            Some(senders) => senders
                .iter()
                .filter(|s| !self.contributors.contains(*s))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl<T> fmt::Debug for Aggregate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("expected", &self.expected)
            .field("received", &self.contributors.len())
            .field("fired", &self.value.is_none())
            .finish()
    }
}
