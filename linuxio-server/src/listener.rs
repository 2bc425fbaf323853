//! Binds the single plain-HTTP listener this service exposes and runs the
//! accept loop as a [`Task`], the same shape every other long-running piece
//! of the service uses.

use async_trait::async_trait;
use task::{ShutdownSignal, Task};
use tokio::net::TcpListener;

use crate::router::make_router;
use crate::AppState;

pub struct HttpListener {
    listener: TcpListener,
    state: AppState,
}

impl HttpListener {
    pub async fn bind(port: u16, state: AppState) -> anyhow::Result<Self> {
        let addr = (std::net::Ipv4Addr::UNSPECIFIED, port);
        let listener = TcpListener::bind(addr).await?;
        info!(port, "listening");
        Ok(Self { listener, state })
    }
}

#[async_trait]
impl Task for HttpListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let app = make_router(self.state);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let app = app.clone();
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let shutdown_signal = shutdown_signal.clone();

                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(move |req| {
                            tower::ServiceExt::oneshot(app.clone(), req)
                        });

                        let conn = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                            .serve_connection_with_upgrades(io, service);

                        tokio::pin!(conn);
                        let mut shutdown_signal = shutdown_signal;

                        tokio::select! {
                            result = &mut conn => {
                                if let Err(error) = result {
                                    debug!(%peer_addr, %error, "connection closed with error");
                                }
                            }
                            _ = shutdown_signal.wait() => {
                                conn.as_mut().graceful_shutdown();
                            }
                        }
                    });
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        Ok(())
    }
}
