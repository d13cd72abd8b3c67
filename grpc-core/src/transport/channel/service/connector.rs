use super::BoxedIo;
use crate::transport::channel::resolver::{ResolvedAddr, ResolverRegistry};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::debug;

/// Dials the target URI: resolves it through the registered [`ResolverRegistry`] and tries every
/// candidate address in order, surfacing a failure only once all of them have been exhausted.
///
/// Plain TCP (with `TCP_NODELAY`) and Unix domain sockets are supported; the optional connect
/// timeout covers each individual dial attempt.
#[derive(Clone)]
pub(crate) struct Connector {
    resolvers: Arc<ResolverRegistry>,
    connect_timeout: Option<Duration>,
}

impl Connector {
    pub(crate) fn new(resolvers: Arc<ResolverRegistry>, connect_timeout: Option<Duration>) -> Self {
        Self {
            resolvers,
            connect_timeout,
        }
    }

    async fn dial(addr: &ResolvedAddr) -> Result<BoxedIo, crate::BoxError> {
        match addr {
            ResolvedAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(BoxedIo::new(hyper_util::rt::TokioIo::new(stream)))
            }
            #[cfg(unix)]
            ResolvedAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(BoxedIo::new(hyper_util::rt::TokioIo::new(stream)))
            }
        }
    }
}

impl Service<http::Uri> for Connector {
    type Response = BoxedIo;
    type Error = crate::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: http::Uri) -> Self::Future {
        let resolver = self.resolvers.for_target(&uri);
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let resolver = resolver
                .ok_or_else(|| format!("no resolver registered for target scheme in {uri:?}"))?;
            let addrs = resolver.resolve(&uri).await?;

            let mut first_error = None;
            for addr in &addrs {
                let attempt = Self::dial(addr);
                let result = match connect_timeout {
                    Some(dur) => match tokio::time::timeout(dur, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err("connect timed out".into()),
                    },
                    None => attempt.await,
                };

                match result {
                    Ok(io) => return Ok(io),
                    Err(error) => {
                        debug!(?addr, %error, "connect attempt failed");
                        first_error.get_or_insert(error);
                    }
                }
            }

            Err(first_error.unwrap_or_else(|| "resolver produced no addresses".into()))
        })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
