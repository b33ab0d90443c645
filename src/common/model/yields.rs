use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::future::Future;

use super::{Item, Request};
use crate::errors::Result;

/// Deferred side effect run after the buffer it was routed to has flushed.
pub type Callback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A value produced by `start_requests`, `parse` or a hook.
pub enum Yield {
    Request(Request),
    Item(Item),
    Callback(Callback),
    None,
    /// Anything a parser cannot legally produce; dispatching it is a fatal error
    Invalid(String),
}

impl fmt::Debug for Yield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Yield::Request(r) => f.debug_tuple("Request").field(&r.url).finish(),
            Yield::Item(i) => f.debug_tuple("Item").field(&i.table).finish(),
            Yield::Callback(_) => write!(f, "Callback"),
            Yield::None => write!(f, "None"),
            Yield::Invalid(desc) => f.debug_tuple("Invalid").field(desc).finish(),
        }
    }
}

impl From<Request> for Yield {
    fn from(request: Request) -> Self {
        Yield::Request(request)
    }
}

impl From<Item> for Yield {
    fn from(item: Item) -> Self {
        Yield::Item(item)
    }
}

impl From<Option<Request>> for Yield {
    fn from(request: Option<Request>) -> Self {
        request.map(Yield::Request).unwrap_or(Yield::None)
    }
}

/// Lazily produced parse results.
pub type YieldStream<'a> = BoxStream<'a, Result<Yield>>;

/// Wraps an async closure as a [`Yield::Callback`].
pub fn callback<F, Fut>(f: F) -> Yield
where
    F: FnOnce() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Yield::Callback(boxed_callback(f))
}

pub fn boxed_callback<F, Fut>(f: F) -> Callback
where
    F: FnOnce() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// A finite stream over already computed yields.
pub fn yields<'a, I>(values: I) -> YieldStream<'a>
where
    I: IntoIterator<Item = Yield>,
    I::IntoIter: Send + 'a,
{
    stream::iter(values.into_iter().map(Ok)).boxed()
}

pub fn empty<'a>() -> YieldStream<'a> {
    stream::empty().boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_yields_stream_in_order() {
        let mut s = yields(vec![
            Request::new("https://a.com").into(),
            Item::new("t").into(),
            Yield::None,
        ]);
        assert!(matches!(s.next().await, Some(Ok(Yield::Request(_)))));
        assert!(matches!(s.next().await, Some(Ok(Yield::Item(_)))));
        assert!(matches!(s.next().await, Some(Ok(Yield::None))));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_callback_runs_once_invoked() {
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        let y = callback(move || async move {
            f.store(true, Ordering::SeqCst);
            Ok(())
        });
        let Yield::Callback(cb) = y else {
            panic!("expected callback");
        };
        assert!(!flag.load(Ordering::SeqCst));
        cb().await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
