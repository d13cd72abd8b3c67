//! Name resolution: turning a target URI into the socket addresses a connector can dial.
//!
//! Resolvers are registered per URI scheme. The defaults cover DNS (which also handles literal
//! IPv4/IPv6 hosts) for `http`/`https`/`dns`, and Unix domain socket paths for `unix`.

use http::Uri;
use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc};

/// A resolved dialable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

/// Resolves one target URI into an ordered list of candidate addresses.
///
/// The connector dials candidates in order and only surfaces a failure once every candidate has
/// been tried.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(
        &self,
        target: &Uri,
    ) -> crate::BoxFuture<'static, Result<Vec<ResolvedAddr>, crate::BoxError>>;
}

/// DNS (and IP-literal) resolution via the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(
        &self,
        target: &Uri,
    ) -> crate::BoxFuture<'static, Result<Vec<ResolvedAddr>, crate::BoxError>> {
        let host = target.host().map(str::to_owned);
        let port = target.port_u16().unwrap_or_else(|| match target.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Box::pin(async move {
            let host = host.ok_or("target URI is missing a host")?;
            // Bracketed IPv6 hosts come back from `Uri::host` still bracketed; `lookup_host`
            // wants them that way too, so the host string is passed through untouched.
            let addrs = tokio::net::lookup_host((host.as_str(), port))
                .await?
                .map(ResolvedAddr::Tcp)
                .collect::<Vec<_>>();
            if addrs.is_empty() {
                return Err(format!("name resolution for {host:?} returned no addresses").into());
            }
            Ok(addrs)
        })
    }
}

/// Unix domain socket targets: `unix:///run/app.sock` or `unix://relative/path`.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UdsResolver;

#[cfg(unix)]
impl Resolver for UdsResolver {
    fn resolve(
        &self,
        target: &Uri,
    ) -> crate::BoxFuture<'static, Result<Vec<ResolvedAddr>, crate::BoxError>> {
        let path = match target.host() {
            // `unix://host/path` keeps the authority as the first path segment.
            Some(host) => format!("{host}{}", target.path()),
            None => target.path().to_owned(),
        };
        Box::pin(async move {
            if path.is_empty() {
                return Err("unix target URI carries no socket path".into());
            }
            Ok(vec![ResolvedAddr::Unix(std::path::PathBuf::from(path))])
        })
    }
}

/// Scheme-indexed set of [`Resolver`]s.
pub struct ResolverRegistry {
    by_scheme: HashMap<String, Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn empty() -> Self {
        Self {
            by_scheme: HashMap::new(),
        }
    }

    /// Registers `resolver` for `scheme`, replacing any previous registration.
    pub fn register(&mut self, scheme: impl Into<String>, resolver: Arc<dyn Resolver>) {
        self.by_scheme.insert(scheme.into(), resolver);
    }

    pub fn for_target(&self, target: &Uri) -> Option<Arc<dyn Resolver>> {
        let scheme = target.scheme_str()?;
        self.by_scheme.get(scheme).cloned()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let dns = Arc::new(DnsResolver);
        registry.register("http", dns.clone());
        registry.register("https", dns.clone());
        registry.register("dns", dns);
        #[cfg(unix)]
        registry.register("unix", Arc::new(UdsResolver));
        registry
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("schemes", &self.by_scheme.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_ipv4_literal() {
        let uri: Uri = "http://127.0.0.1:50051".parse().unwrap();
        let addrs = DnsResolver.resolve(&uri).await.unwrap();
        assert_eq!(
            addrs,
            vec![ResolvedAddr::Tcp("127.0.0.1:50051".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn resolves_ipv6_literal_with_port() {
        let uri: Uri = "http://[::1]:50051".parse().unwrap();
        let addrs = DnsResolver.resolve(&uri).await.unwrap();
        assert_eq!(addrs, vec![ResolvedAddr::Tcp("[::1]:50051".parse().unwrap())]);
    }

    #[tokio::test]
    async fn default_port_follows_the_scheme() {
        let uri: Uri = "https://127.0.0.1".parse().unwrap();
        let addrs = DnsResolver.resolve(&uri).await.unwrap();
        assert_eq!(addrs, vec![ResolvedAddr::Tcp("127.0.0.1:443".parse().unwrap())]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uds_target_keeps_the_full_path() {
        let uri: Uri = "unix:///run/test.sock".parse().unwrap();
        let addrs = UdsResolver.resolve(&uri).await.unwrap();
        assert_eq!(
            addrs,
            vec![ResolvedAddr::Unix(std::path::PathBuf::from("/run/test.sock"))]
        );
    }

    #[test]
    fn registry_dispatches_on_scheme() {
        let registry = ResolverRegistry::default();
        assert!(registry.for_target(&"http://a".parse().unwrap()).is_some());
        assert!(registry.for_target(&"ftp://a".parse().unwrap()).is_none());
    }
}
