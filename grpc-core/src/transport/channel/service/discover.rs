use super::Connection;
use crate::transport::channel::Endpoint;
use std::{
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc::Receiver;
use tokio_stream::Stream;

/// An update to the set of endpoints a balanced channel spreads its RPCs over.
#[derive(Debug, Clone)]
pub enum Change<K> {
    Insert(K, Endpoint),
    Remove(K),
}

/// The result of applying one [`Change`]: the endpoint has been turned into a lazily connecting
/// [`Connection`] that the balancer can start dispatching to.
pub(crate) enum ServiceChange<K> {
    Insert(K, Connection),
    Remove(K),
}

/// Drives a caller-supplied stream of endpoint [`Change`]s, materializing a [`Connection`] for
/// every inserted endpoint. Ends when the sender half is dropped.
pub(crate) struct DynamicServiceStream<K: Hash + Eq + Clone> {
    changes: Receiver<Change<K>>,
}

impl<K: Hash + Eq + Clone> DynamicServiceStream<K> {
    pub(crate) fn new(changes: Receiver<Change<K>>) -> Self {
        Self { changes }
    }
}

impl<K: Hash + Eq + Clone> Stream for DynamicServiceStream<K> {
    type Item = ServiceChange<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let c = &mut self.get_mut().changes;
        match Pin::new(c).poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(change)) => match change {
                Change::Insert(k, endpoint) => {
                    let connection = Connection::lazy(endpoint.http_connector(), endpoint);
                    Poll::Ready(Some(ServiceChange::Insert(k, connection)))
                }
                Change::Remove(k) => Poll::Ready(Some(ServiceChange::Remove(k))),
            },
        }
    }
}

impl<K: Hash + Eq + Clone> Unpin for DynamicServiceStream<K> {}
