//! DNS resolution for the passthrough engine (§4.5 step 3). Queries a
//! caller-supplied server list first when `lookupOptions.servers` is set,
//! falling back to the system resolver on empty/timeout; races A and AAAA
//! lookups happy-eyeballs style.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;

#[derive(Clone, Debug, Default)]
pub struct LookupOptions {
	pub servers: Vec<SocketAddr>,
	/// Fall back to the system resolver if `servers` returns nothing.
	pub fallback: bool,
}

const CUSTOM_SERVER_TIMEOUT: Duration = Duration::from_millis(2000);
/// Head-start given to whichever address family resolves first before the
/// other family's dial is also raced in (§4.5 step 3 "happy-eyeballs").
pub const HAPPY_EYEBALLS_HEAD_START: Duration = Duration::from_millis(250);

pub struct Resolver {
	system: Arc<TokioResolver>,
	custom: Option<Arc<TokioResolver>>,
	fallback: bool,
}

impl Resolver {
	pub fn system() -> anyhow::Result<Self> {
		let resolver = hickory_resolver::Resolver::builder_tokio()?.build();
		Ok(Resolver {
			system: Arc::new(resolver),
			custom: None,
			fallback: true,
		})
	}

	pub fn with_lookup_options(opts: &LookupOptions) -> anyhow::Result<Self> {
		let mut base = Self::system()?;
		if opts.servers.is_empty() {
			return Ok(base);
		}
		let group = NameServerConfigGroup::from_ips_clear(
			&opts.servers.iter().map(|s| s.ip()).collect::<Vec<_>>(),
			opts.servers.first().map(|s| s.port()).unwrap_or(53),
			true,
		);
		let cfg = ResolverConfig::from_parts(None, vec![], group);
		let mut builder =
			hickory_resolver::Resolver::builder_with_config(cfg, TokioConnectionProvider::default());
		builder.options_mut().timeout = CUSTOM_SERVER_TIMEOUT;
		base.custom = Some(Arc::new(builder.build()));
		base.fallback = opts.fallback;
		Ok(base)
	}

	/// Resolves `host` to every address it has, trying the custom server
	/// list first (with a timeout), then the system resolver.
	pub async fn resolve(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(vec![ip]);
		}
		if let Some(custom) = &self.custom {
			match tokio::time::timeout(CUSTOM_SERVER_TIMEOUT, custom.lookup_ip(host)).await {
				Ok(Ok(lookup)) => {
					let ips: Vec<IpAddr> = lookup.iter().collect();
					if !ips.is_empty() {
						return Ok(ips);
					}
				},
				_ => {},
			}
			if !self.fallback {
				anyhow::bail!("custom resolver returned no results for {host} and fallback is disabled");
			}
		}
		let lookup = self.system.lookup_ip(host).await?;
		Ok(lookup.iter().collect())
	}
}

/// Dials the first address to connect successfully, racing IPv4 against
/// IPv6 with a head start for whichever family the resolver listed first
/// (§4.5 step 3).
pub async fn happy_eyeballs_connect(
	addrs: &[IpAddr],
	port: u16,
) -> std::io::Result<tokio::net::TcpStream> {
	use futures_util::FutureExt;

	if addrs.is_empty() {
		return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to dial"));
	}
	let (first_family, rest): (Vec<_>, Vec<_>) = {
		let first_is_v6 = addrs[0].is_ipv6();
		addrs.iter().partition(|a| a.is_ipv6() == first_is_v6)
	};

	let primary = dial_any(&first_family, port);
	tokio::pin!(primary);
	match tokio::time::timeout(HAPPY_EYEBALLS_HEAD_START, &mut primary).await {
		Ok(result) => result,
		Err(_) if rest.is_empty() => primary.await,
		Err(_) => {
			let secondary = dial_any(&rest, port);
			tokio::pin!(secondary);
			futures_util::future::select(primary, secondary)
				.map(|either| either.factor_first().0)
				.await
		},
	}
}

async fn dial_any(addrs: &[IpAddr], port: u16) -> std::io::Result<tokio::net::TcpStream> {
	let mut last_err = None;
	for addr in addrs {
		match tokio::net::TcpStream::connect(SocketAddr::new(*addr, port)).await {
			Ok(stream) => return Ok(stream),
			Err(e) => last_err = Some(e),
		}
	}
	Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses")))
}
