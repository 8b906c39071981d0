//! Shared test utilities for cirrus-model integration tests.
//!
//! Spawns the mock compute API on an ephemeral port. The model itself is
//! single-threaded, so tests drive it inside a `LocalSet`.

#![allow(dead_code)]

use cirrus_mock::{AppState, EnvelopeStyle, MockOptions, create_router};
use cirrus_model::{Envelope, ModelConfig, PollConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Transition delay used by the mock in tests.
pub const TRANSITION: Duration = Duration::from_millis(100);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(MockOptions {
            transition_delay: TRANSITION,
            ..MockOptions::default()
        })
        .await
    }

    pub async fn spawn_with(options: MockOptions) -> Self {
        let state = AppState::new(options);
        let router = create_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/compute/v2", self.addr)
    }

    pub fn admin_url(&self) -> String {
        format!("http://{}/admin/bulk", self.addr)
    }

    /// Model config pointing at this server.
    pub fn config(&self) -> ModelConfig {
        let envelope = match self.state.envelope() {
            EnvelopeStyle::Legacy => Envelope::Legacy,
            EnvelopeStyle::Current => Envelope::Current,
        };
        ModelConfig {
            api_url: self.api_url(),
            token: self.state.options.token.clone(),
            envelope,
            admin_url: Some(self.admin_url()),
            incremental: true,
            poll: PollConfig {
                base_ms: 200,
                fast_ms: 50,
                max_ms: 1000,
                step_ms: 50,
                accelerate_after: 1,
                decay_after: 4,
            },
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
