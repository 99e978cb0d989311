//! Listening socket and accept loop (§4.1). Binds once at startup,
//! raises the open-fd soft limit best-effort, then spawns one worker
//! task per accepted connection until told to shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::BindError;
use crate::metrics::Metrics;

const EMFILE_BACKOFF: Duration = Duration::from_millis(50);
/// How long running workers get to finish on their own before the
/// listener shutdown forces them closed (§5).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Acceptor {
	listener: TcpListener,
	config: Arc<Config>,
	metrics: Arc<Metrics>,
}

impl Acceptor {
	pub async fn bind(config: Arc<Config>, metrics: Arc<Metrics>) -> Result<Self, BindError> {
		let addr = std::net::SocketAddr::new(config.bind_addr, config.bind_port);
		let std_listener = bind_with_backlog(addr, config.backlog).map_err(|source| BindError::Bind { addr, source })?;
		std_listener.set_nonblocking(true).map_err(|source| BindError::Bind { addr, source })?;
		let listener = TcpListener::from_std(std_listener).map_err(|source| BindError::Bind { addr, source })?;

		raise_fd_limit(config.open_file_limit);

		Ok(Self {
			listener,
			config,
			metrics,
		})
	}

	pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
		self.listener.local_addr()
	}

	/// Runs the accept loop until `shutdown` is cancelled, then waits up
	/// to `SHUTDOWN_GRACE` for in-flight workers before returning.
	pub async fn run(self, shutdown: CancellationToken) {
		let mut workers = JoinSet::new();
		info!(addr = %self.listener.local_addr().ok().map(|a| a.to_string()).unwrap_or_default(), "listening");

		loop {
			tokio::select! {
				_ = shutdown.cancelled() => break,
				accepted = self.listener.accept() => {
					match accepted {
						Ok((stream, peer)) => {
							self.metrics.record_connection_accepted();
							let config = self.config.clone();
							let metrics = self.metrics.clone();
							let worker_shutdown = shutdown.clone();
							workers.spawn(async move {
								crate::worker::handle_connection(stream, peer, config, metrics, worker_shutdown).await;
							});
						},
						Err(e) if is_emfile(&e) => {
							warn!("accept failed with EMFILE, backing off");
							tokio::time::sleep(EMFILE_BACKOFF).await;
						},
						Err(e) => {
							error!(error = %e, "accept failed");
						},
					}
				}
			}
		}

		info!("shutting down listener, draining in-flight connections");
		let drain = async {
			while workers.join_next().await.is_some() {}
		};
		if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
			warn!("shutdown grace period elapsed, aborting remaining connections");
			workers.shutdown().await;
		}
	}
}

fn is_emfile(e: &std::io::Error) -> bool {
	e.raw_os_error() == Some(libc::EMFILE)
}

fn bind_with_backlog(addr: std::net::SocketAddr, backlog: u32) -> std::io::Result<std::net::TcpListener> {
	use socket2::{Domain, Socket, Type};
	let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
	let socket = Socket::new(domain, Type::STREAM, None)?;
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(backlog as i32)?;
	Ok(socket.into())
}

/// Raises RLIMIT_NOFILE toward `want`, best effort (§4.1): a denial is
/// logged and the process continues with whatever limit it already has.
fn raise_fd_limit(want: u64) {
	unsafe {
		let mut rlim = libc::rlimit {
			rlim_cur: 0,
			rlim_max: 0,
		};
		if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) != 0 {
			warn!("getrlimit(RLIMIT_NOFILE) failed, leaving fd limit unchanged");
			return;
		}
		let target = want.min(rlim.rlim_max);
		if target <= rlim.rlim_cur {
			return;
		}
		rlim.rlim_cur = target;
		if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
			warn!(want, "failed to raise open file limit, continuing with current limit");
		} else {
			info!(limit = target, "raised open file limit");
		}
	}
}
