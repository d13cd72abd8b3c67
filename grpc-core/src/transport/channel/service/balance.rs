use super::discover::{DynamicServiceStream, ServiceChange};
use super::Connection;
use crate::body::Body;
use crate::transport::channel::BoxFuture;
use http::{Request, Response};
use std::{
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};
use tokio_stream::Stream;
use tower_service::Service;
use tracing::debug;

/// Spreads RPCs over a dynamic set of connections in round-robin order.
///
/// Each `poll_ready` first applies any pending endpoint changes, then scans for a ready
/// connection starting one past the previously used slot, so consecutive RPCs rotate through the
/// endpoint set instead of piling onto the first healthy one.
pub(crate) struct RoundRobin<K: Hash + Eq + Clone> {
    discover: DynamicServiceStream<K>,
    services: Vec<(K, Connection)>,
    changes_done: bool,
    next: usize,
    ready_index: Option<usize>,
}

impl<K: Hash + Eq + Clone> RoundRobin<K> {
    pub(crate) fn new(discover: DynamicServiceStream<K>) -> Self {
        Self {
            discover,
            services: Vec::new(),
            changes_done: false,
            next: 0,
            ready_index: None,
        }
    }

    fn remove(&mut self, key: &K) {
        self.services.retain(|(k, _)| k != key);
    }
}

impl<K: Hash + Eq + Clone> Service<Request<Body>> for RoundRobin<K> {
    type Response = Response<Body>;
    type Error = crate::BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        while let Poll::Ready(item) = Pin::new(&mut self.discover).poll_next(cx) {
            match item {
                Some(ServiceChange::Insert(key, connection)) => {
                    self.remove(&key);
                    self.services.push((key, connection));
                }
                Some(ServiceChange::Remove(key)) => self.remove(&key),
                None => {
                    self.changes_done = true;
                    break;
                }
            }
        }

        'scan: loop {
            let len = self.services.len();
            if len == 0 {
                return if self.changes_done {
                    Poll::Ready(Err(crate::Status::unavailable("subchannel is unavailable").into()))
                } else {
                    // More endpoints may still arrive over the change stream.
                    Poll::Pending
                };
            }

            for offset in 0..len {
                let idx = (self.next + offset) % len;
                match self.services[idx].1.poll_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        self.ready_index = Some(idx);
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(error)) => {
                        debug!(%error, "dropping failed connection from balance set");
                        self.services.remove(idx);
                        continue 'scan;
                    }
                    Poll::Pending => {}
                }
            }

            return Poll::Pending;
        }
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let idx = self
            .ready_index
            .take()
            .expect("poll_ready must return Ready(Ok) before call");
        self.next = idx + 1;
        self.services[idx].1.call(req)
    }
}

impl<K: Hash + Eq + Clone> std::fmt::Debug for RoundRobin<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobin")
            .field("endpoints", &self.services.len())
            .finish()
    }
}
