//! The forward-mode TCP listener.
//!
//! Forwarding has no protocol handshake: the destination is fixed by
//! configuration (the dispatcher's router substitutes it), so the listener
//! only accepts peers and dispatches them. No authentication happens at
//! this layer, and there are no wire replies — the client just sees the
//! tunnel.

use std::{io::Result as IoResult, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	conn::{ClientChannel, ConnId, Connection, NoReplies, ServerKind},
	dispatch::{DispatchContext, Dispatcher},
	listener::{bind_socket, Listener, ListenerError, ListenerOptions},
};

/// The plain TCP forwarding listener. Binds its socket at construction
/// time.
pub struct ForwardListener {
	opts: ListenerOptions,
	listener: tokio::net::TcpListener,
	dispatcher: Arc<Dispatcher>,
}

impl ForwardListener {
	/// Create a forwarding listener, validating the options and binding
	/// the listening socket.
	///
	/// # Errors
	/// Returns a [`ListenerError`] when the options are invalid or the
	/// socket can not be bound.
	pub fn new(opts: ListenerOptions, dispatcher: Arc<Dispatcher>) -> Result<Self, ListenerError> {
		opts.validate()?;
		let listener = bind_socket(opts.socket_addr())?;

		Ok(Self {
			opts,
			listener,
			dispatcher,
		})
	}

	/// The address the listening socket is actually bound to
	///
	/// # Errors
	/// Returns the underlying IO error if the socket is gone.
	pub fn local_addr(&self) -> IoResult<SocketAddr> {
		self.listener.local_addr()
	}
}

#[async_trait]
impl Listener for ForwardListener {
	async fn listen(&self, cancel: CancellationToken) -> Result<(), ListenerError> {
		let addr = self.bound_addr();

		info!(%addr, "forward: listening");

		loop {
			tokio::select! {
				res = self.listener.accept() => match res {
					Ok((stream, peer)) => {
						let dispatcher = Arc::clone(&self.dispatcher);
						let cancel = cancel.child_token();

						spawn(async move {
							let id = ConnId::generate();

							let conn = Connection {
								id: id.clone(),
								kind: ServerKind::Tcp,
								source: peer,
								destination: None,
								identity: None,
								channel: ClientChannel::Stream(Box::new(stream)),
								replies: Box::new(NoReplies),
							};

							dispatcher
								.dispatch(DispatchContext::new(id, ServerKind::Tcp, cancel), conn)
								.await;
						});
					}
					Err(err) => {
						warn!(?err, %addr, "error accepting forwarded connection");
					}
				},
				() = cancel.cancelled() => {
					debug!(%addr, "forward: listener shutting down");
					return Ok(());
				}
			}
		}
	}

	fn bound_addr(&self) -> SocketAddr {
		self.local_addr().unwrap_or_else(|_| self.opts.socket_addr())
	}
}
