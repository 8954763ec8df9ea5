//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! A route module holds handlers of *different* types in one map, so each
//! one is erased behind `dyn ErasedHandler`:
//!
//! ```text
//! async fn get_user(event: ApiEvent) -> Response { … }   ← user writes this
//!        ↓ RouteModule::new().get(get_user)
//! get_user.into_boxed_handler()                         ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(get_user))                         ← stored as BoxedHandler
//!        ↓
//! handler.call(event)  at request time                  ← one vtable dispatch
//!        ↓
//! Box::pin(async { get_user(event).await.into_outcome() })
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::event::ApiEvent;
use crate::response::{IntoOutcome, Outcome};

/// A heap-allocated, type-erased future resolving to a handler [`Outcome`].
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` because it appears in the return type of the public
/// `Handler` trait.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, event: ApiEvent) -> BoxFuture;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler.
///
/// Satisfied by any `async fn` with the signature:
///
/// ```text
/// async fn name(event: ApiEvent) -> impl IntoOutcome
/// ```
///
/// `IntoOutcome` covers [`Response`](crate::Response), `Option<Response>`,
/// `()`, strings, [`Status`](crate::Status), [`Json`](crate::Json), and
/// `Result<T, E>` where `E: Into<HandlerError>`.
///
/// Sealed: only the blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(ApiEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(ApiEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(ApiEvent) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, event: ApiEvent) -> BoxFuture {
        let fut = (self.0)(event);
        Box::pin(async move { fut.await.into_outcome() })
    }
}

/// Lets handlers say `Err(HandlerError::new(..))?` without naming the type twice.
pub type HandlerResult<T> = Result<T, HandlerError>;
