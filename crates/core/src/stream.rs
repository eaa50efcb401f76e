//! Pull-based lazy streams.
//!
//! A stream is created per request and consumed once by a single task. `next` yields
//! `Ok(None)` at the end; callers that need an item turn that into [`O2Error::End`].

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{O2Error, O2Result};

#[async_trait]
pub trait Stream: Send {
    type Item: Send;

    /// Advance by one item. `Ok(None)` marks the end of the sequence.
    async fn next(&mut self, ctx: &CancellationToken) -> O2Result<Option<Self::Item>>;

    /// Remaining item count when the source knows it.
    fn size_hint(&self) -> Option<usize> { None }
}

pub type BoxStream<T> = Box<dyn Stream<Item = T>>;

/// Next item or the end-of-stream sentinel.
pub async fn first<T: Send>(stream: &mut BoxStream<T>, ctx: &CancellationToken) -> O2Result<T> {
    stream.next(ctx).await?.ok_or(O2Error::End)
}

// ---------------- sources ----------------

struct Items<T> { items: VecDeque<T> }

#[async_trait]
impl<T: Send> Stream for Items<T> {
    type Item = T;
    async fn next(&mut self, _ctx: &CancellationToken) -> O2Result<Option<T>> { Ok(self.items.pop_front()) }
    fn size_hint(&self) -> Option<usize> { Some(self.items.len()) }
}

/// Stream that pours out the given items in order.
pub fn from_items<T: Send + 'static>(items: impl IntoIterator<Item = T>) -> BoxStream<T> {
    Box::new(Items { items: items.into_iter().collect() })
}

/// Stream with no items.
pub fn empty<T: Send + 'static>() -> BoxStream<T> { from_items(Vec::new()) }

struct Repeat<T> { item: T, left: usize }

#[async_trait]
impl<T: Clone + Send + Sync> Stream for Repeat<T> {
    type Item = T;
    async fn next(&mut self, _ctx: &CancellationToken) -> O2Result<Option<T>> {
        if self.left == 0 { return Ok(None); }
        self.left -= 1;
        Ok(Some(self.item.clone()))
    }
    fn size_hint(&self) -> Option<usize> { Some(self.left) }
}

/// Stream yielding `item` exactly `times` times.
pub fn repeat<T: Clone + Send + Sync + 'static>(item: T, times: usize) -> BoxStream<T> {
    Box::new(Repeat { item, left: times })
}

// ---------------- combinators ----------------

struct Map<T, F> { source: BoxStream<T>, f: F }

#[async_trait]
impl<T, U, F> Stream for Map<T, F>
where
    T: Send + 'static,
    U: Send,
    F: FnMut(T) -> O2Result<U> + Send,
{
    type Item = U;
    async fn next(&mut self, ctx: &CancellationToken) -> O2Result<Option<U>> {
        match self.source.next(ctx).await? {
            Some(item) => (self.f)(item).map(Some),
            None => Ok(None),
        }
    }
    fn size_hint(&self) -> Option<usize> { self.source.size_hint() }
}

/// Lazily transform every item. A transform error ends consumption with that error.
pub fn map<T, U, F>(source: BoxStream<T>, f: F) -> BoxStream<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> O2Result<U> + Send + 'static,
{
    Box::new(Map { source, f })
}

struct Select<T, P> { source: BoxStream<T>, pred: P }

#[async_trait]
impl<T, P> Stream for Select<T, P>
where
    T: Send + 'static,
    P: FnMut(&T) -> O2Result<bool> + Send,
{
    type Item = T;
    async fn next(&mut self, ctx: &CancellationToken) -> O2Result<Option<T>> {
        loop {
            if ctx.is_cancelled() { return Err(O2Error::Cancelled); }
            match self.source.next(ctx).await? {
                Some(item) => { if (self.pred)(&item)? { return Ok(Some(item)); } }
                None => return Ok(None),
            }
        }
    }
}

/// Lazily keep the items accepted by `pred`.
pub fn select<T, P>(source: BoxStream<T>, pred: P) -> BoxStream<T>
where
    T: Send + 'static,
    P: FnMut(&T) -> O2Result<bool> + Send + 'static,
{
    Box::new(Select { source, pred })
}

struct Limit<T> { source: BoxStream<T>, left: usize }

#[async_trait]
impl<T: Send + 'static> Stream for Limit<T> {
    type Item = T;
    async fn next(&mut self, ctx: &CancellationToken) -> O2Result<Option<T>> {
        if self.left == 0 { return Ok(None); }
        let item = self.source.next(ctx).await?;
        if item.is_some() { self.left -= 1; }
        Ok(item)
    }
    fn size_hint(&self) -> Option<usize> { self.source.size_hint().map(|n| n.min(self.left)) }
}

/// Stop after at most `n` items.
pub fn limit<T: Send + 'static>(source: BoxStream<T>, n: usize) -> BoxStream<T> {
    Box::new(Limit { source, left: n })
}

/// Drain a stream, pre-sizing from its hint. Cancellation is checked before every step.
pub async fn collect<T: Send>(ctx: &CancellationToken, mut stream: BoxStream<T>) -> O2Result<Vec<T>> {
    let mut out = Vec::with_capacity(stream.size_hint().unwrap_or(0));
    loop {
        if ctx.is_cancelled() { return Err(O2Error::Cancelled); }
        match stream.next(ctx).await? {
            Some(item) => out.push(item),
            None => return Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn map_select_are_lazy_and_ordered() {
        let ctx = CancellationToken::new();
        let s = from_items(1..=6);
        let s = select(s, |n| Ok(n % 2 == 0));
        let s = map(s, |n| Ok(n * 10));
        assert_eq!(collect(&ctx, s).await.unwrap(), vec![20, 40, 60]);
    }

    #[tokio::test]
    async fn map_error_stops_collection() {
        let ctx = CancellationToken::new();
        let s = map(from_items(vec![1, 2, 3]), |n| if n == 2 { Err(O2Error::validation("two")) } else { Ok(n) });
        let err = collect(&ctx, s).await.unwrap_err();
        assert_eq!(err, O2Error::Validation("two".into()));
    }

    #[tokio::test]
    async fn collect_honors_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = collect(&ctx, repeat("x", 1_000)).await.unwrap_err();
        assert_eq!(err, O2Error::Cancelled);
    }

    #[tokio::test]
    async fn size_hint_flows_through_map_and_limit() {
        let s = map(from_items(vec![1, 2, 3, 4]), Ok);
        assert_eq!(s.size_hint(), Some(4));
        let s = limit(s, 2);
        assert_eq!(s.size_hint(), Some(2));
        let ctx = CancellationToken::new();
        assert_eq!(collect(&ctx, s).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn first_on_empty_is_end() {
        let ctx = CancellationToken::new();
        let mut s = empty::<u8>();
        assert_eq!(first(&mut s, &ctx).await.unwrap_err(), O2Error::End);
    }
}
