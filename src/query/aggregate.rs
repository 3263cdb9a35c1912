// src/query/aggregate.rs
//
// Aggregate terminals
//
// One operation table per concern instead of one overload per numeric type:
// `Numeric` covers the five summable domains, `Average` adds the promotion
// rules (integers average as f64, f32 accumulates in f64, decimal stays
// exact).

use rust_decimal::Decimal;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::query::Query;

/// A summable numeric domain.
pub trait Numeric: Copy + Send + Sync + 'static {
    const ZERO: Self;

    fn add(self, rhs: Self) -> Self;
}

impl Numeric for i32 {
    const ZERO: Self = 0;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl Numeric for i64 {
    const ZERO: Self = 0;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl Numeric for f32 {
    const ZERO: Self = 0.0;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl Numeric for f64 {
    const ZERO: Self = 0.0;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl Numeric for Decimal {
    const ZERO: Self = Decimal::ZERO;

    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
}

/// An averageable numeric domain and its promoted output type.
///
/// `mean` returns `None` for an empty slice; emptiness policy (error versus
/// `None`) belongs to the query terminals.
pub trait Average: Numeric {
    type Output;

    fn mean(values: &[Self]) -> Option<Self::Output>;
}

impl Average for i32 {
    type Output = f64;

    fn mean(values: &[Self]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        // Exact integer accumulation; rounding happens once, at the division.
        let sum: i128 = values.iter().map(|&v| i128::from(v)).sum();
        Some(sum as f64 / values.len() as f64)
    }
}

impl Average for i64 {
    type Output = f64;

    fn mean(values: &[Self]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let sum: i128 = values.iter().map(|&v| i128::from(v)).sum();
        Some(sum as f64 / values.len() as f64)
    }
}

impl Average for f32 {
    type Output = f32;

    fn mean(values: &[Self]) -> Option<f32> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().map(|&v| f64::from(v)).sum();
        Some((sum / values.len() as f64) as f32)
    }
}

impl Average for f64 {
    type Output = f64;

    fn mean(values: &[Self]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(sum / values.len() as f64)
    }
}

impl Average for Decimal {
    type Output = Decimal;

    fn mean(values: &[Self]) -> Option<Decimal> {
        if values.is_empty() {
            return None;
        }
        let sum = values.iter().fold(Decimal::ZERO, |acc, &v| acc + v);
        Some(sum / Decimal::from(values.len() as u64))
    }
}

fn sum_values<N: Numeric>(values: impl Iterator<Item = N>) -> N {
    values.fold(N::ZERO, N::add)
}

fn min_of_values<K: PartialOrd>(values: Vec<K>) -> Result<K> {
    let mut iter = values.into_iter();
    let mut best = iter.next().ok_or(Error::NoElement)?;
    for value in iter {
        if value < best {
            best = value;
        }
    }
    Ok(best)
}

fn max_of_values<K: PartialOrd>(values: Vec<K>) -> Result<K> {
    let mut iter = values.into_iter();
    let mut best = iter.next().ok_or(Error::NoElement)?;
    for value in iter {
        if value > best {
            best = value;
        }
    }
    Ok(best)
}

impl<E: Entity> Query<E> {
    /// Sum of `select` over the matching rows; the domain zero when empty.
    pub fn sum_of<N: Numeric>(&self, select: impl Fn(&E) -> N) -> Result<N> {
        Ok(sum_values(self.to_vec()?.iter().map(select)))
    }

    /// Async form of [`Query::sum_of`].
    pub async fn sum_of_async<N: Numeric>(&self, select: impl Fn(&E) -> N) -> Result<N> {
        Ok(sum_values(self.to_vec_async().await?.iter().map(select)))
    }

    /// Sum over a nullable selector; absent values are skipped, so an
    /// all-absent (or empty) result is the domain zero.
    pub fn sum_opt_of<N: Numeric>(&self, select: impl Fn(&E) -> Option<N>) -> Result<N> {
        Ok(sum_values(self.to_vec()?.iter().filter_map(select)))
    }

    /// Async form of [`Query::sum_opt_of`].
    pub async fn sum_opt_of_async<N: Numeric>(
        &self,
        select: impl Fn(&E) -> Option<N>,
    ) -> Result<N> {
        Ok(sum_values(self.to_vec_async().await?.iter().filter_map(select)))
    }

    /// Average of `select` over the matching rows, promoted per the
    /// [`Average`] table. Fails with [`Error::NoElement`] when empty.
    pub fn avg_of<N: Average>(&self, select: impl Fn(&E) -> N) -> Result<N::Output> {
        let values: Vec<N> = self.to_vec()?.iter().map(select).collect();
        N::mean(&values).ok_or(Error::NoElement)
    }

    /// Async form of [`Query::avg_of`].
    pub async fn avg_of_async<N: Average>(
        &self,
        select: impl Fn(&E) -> N,
    ) -> Result<N::Output> {
        let values: Vec<N> = self.to_vec_async().await?.iter().map(select).collect();
        N::mean(&values).ok_or(Error::NoElement)
    }

    /// Average over a nullable selector; `None` when no row carries a value.
    pub fn avg_opt_of<N: Average>(
        &self,
        select: impl Fn(&E) -> Option<N>,
    ) -> Result<Option<N::Output>> {
        let values: Vec<N> = self.to_vec()?.iter().filter_map(select).collect();
        Ok(N::mean(&values))
    }

    /// Async form of [`Query::avg_opt_of`].
    pub async fn avg_opt_of_async<N: Average>(
        &self,
        select: impl Fn(&E) -> Option<N>,
    ) -> Result<Option<N::Output>> {
        let values: Vec<N> = self.to_vec_async().await?.iter().filter_map(select).collect();
        Ok(N::mean(&values))
    }

    /// Smallest `select` value, or [`Error::NoElement`] when empty.
    pub fn min_of<K: PartialOrd>(&self, select: impl Fn(&E) -> K) -> Result<K> {
        min_of_values(self.to_vec()?.iter().map(select).collect())
    }

    /// Async form of [`Query::min_of`].
    pub async fn min_of_async<K: PartialOrd>(&self, select: impl Fn(&E) -> K) -> Result<K> {
        min_of_values(self.to_vec_async().await?.iter().map(select).collect())
    }

    /// Largest `select` value, or [`Error::NoElement`] when empty.
    pub fn max_of<K: PartialOrd>(&self, select: impl Fn(&E) -> K) -> Result<K> {
        max_of_values(self.to_vec()?.iter().map(select).collect())
    }

    /// Async form of [`Query::max_of`].
    pub async fn max_of_async<K: PartialOrd>(&self, select: impl Fn(&E) -> K) -> Result<K> {
        max_of_values(self.to_vec_async().await?.iter().map(select).collect())
    }
}
