//! The HTTP front end. The front end stays thin: it parses requests,
//! checks tokens, and delegates to the [`Service`].

mod api;
pub mod interface;
mod util;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use crate::auth::TokenAuth;
use crate::service::Service;

pub struct LiveServer {
    service: Arc<Service>,
    auth: Arc<TokenAuth>,
}

impl LiveServer {
    pub fn new(service: Arc<Service>, auth: Arc<TokenAuth>) -> LiveServer {
        LiveServer { service, auth }
    }

    /// Serves forever on `address`, on a runtime owned by this call.
    pub fn start(self, address: SocketAddr) -> anyhow::Result<()> {
        let LiveServer { service, auth } = self;

        let rt = Runtime::new().context("Failed to start tokio runtime")?;
        rt.block_on(async move {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind {address}"))?;

            log::info!("Listening: http://{address}");

            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = Arc::clone(&service);
                let auth = Arc::clone(&auth);

                tokio::spawn(async move {
                    let handler = service_fn(move |req: Request<Incoming>| {
                        let service = Arc::clone(&service);
                        let auth = Arc::clone(&auth);

                        async move { Ok::<_, Infallible>(api::call(service, auth, req).await) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, handler).await {
                        log::error!("Error serving connection: {err}");
                    }
                });
            }
        })
    }
}
