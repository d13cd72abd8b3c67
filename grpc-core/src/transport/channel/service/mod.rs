use std::{cell::RefCell, future::Future};

use tower::{Layer, Service};

mod modifier_fn;
pub(crate) use self::modifier_fn::default as modifier_fn_default;
use self::modifier_fn::ModifierFn;

mod request_modifiers;
use self::request_modifiers::*;

mod reconnect;
use self::reconnect::Reconnect;

mod connection;
pub(super) use self::connection::Connection;

mod balance;
pub(super) use self::balance::RoundRobin;

mod discover;
pub use self::discover::Change;
pub(super) use self::discover::DynamicServiceStream;

mod lifecycle;
pub use self::lifecycle::{CloseReason, ConnectionEvent};
pub(crate) use self::lifecycle::{ConnectionMachine, Effect, Input};

mod io;
use self::io::BoxedIo;

mod connector;
pub(crate) use self::connector::Connector;

mod executor;
pub use self::executor::Executor;
pub(super) use self::executor::SharedExec;

/// A [`tower::Layer`] over an `FnOnce` service constructor.
///
/// The connection stack is assembled exactly once per [`Connection`], but several of its
/// middlewares capture non-`Clone` state, so their constructors are `FnOnce`. `Layer::layer`
/// takes `&self`, so the closure is parked in a `RefCell<Option<_>>` and taken out on first use;
/// a second `layer()` call on the same value panics.
#[derive(Clone, Debug)]
pub(crate) struct LayerFnOnce<F> {
    f: RefCell<Option<F>>,
}

impl<F> LayerFnOnce<F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f: RefCell::new(Some(f)),
        }
    }
}

impl<F, S, Out> Layer<S> for LayerFnOnce<F>
where
    F: FnOnce(S) -> Out,
{
    type Service = Out;

    fn layer(&self, inner: S) -> Self::Service {
        let f = self
            .f
            .borrow_mut()
            .take()
            .expect("LayerFnOnce used more than once");
        f(inner)
    }
}

/// A [`Service`] that can additionally accept its request as a future.
///
/// The request-modifier middlewares each rewrite the request asynchronously. Chaining them
/// through plain `Service::call` would force one boxed future per layer; passing the
/// still-pending request down the stack lets the whole chain collapse into the single boxed
/// future at the bottom.
pub(crate) trait AsyncService<T>: Service<T> {
    fn async_call(&mut self, input: impl Future<Output = T> + Send + 'static) -> Self::Future;
}
