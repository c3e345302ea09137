//! Gantry controller over a telnet-style TCP line protocol.
//!
//! A transport request is one line: `move <fx> <fy> <tx> <ty>`. The controller
//! picks the bottle up at `(fx, fy)`, sets it down at `(tx, ty)` and answers
//! `ok`, or `err <reason>` when the move was refused.

use crate::error::{AppResult, RigError};
use crate::hardware::adapter::{DeviceAdapter, DeviceCommand, DeviceResponse};
use crate::hardware::transport::{DeviceLink, Endpoint, LineTransport};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Live gantry adapter.
pub struct GantryAdapter {
    link: DeviceLink,
    timeout: Duration,
}

impl GantryAdapter {
    /// Adapter for the controller at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            link: DeviceLink::new(
                "Gantry",
                Endpoint::Tcp {
                    host: host.into(),
                    port,
                },
            ),
            timeout: Duration::from_secs(30),
        }
    }

    /// Adapter over an already connected transport.
    pub fn with_transport(transport: Box<dyn LineTransport>) -> Self {
        Self {
            link: DeviceLink::connected("Gantry", transport),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set the connect and reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn move_bottle(&self, from: [f64; 2], to: [f64; 2]) -> AppResult<()> {
        let request = format!("move {} {} {} {}\n", from[0], from[1], to[0], to[1]);
        let reply = self.link.request(request.as_bytes(), self.timeout).await?;
        debug!(?from, ?to, %reply, "Gantry replied");

        if reply.eq_ignore_ascii_case("ok") {
            Ok(())
        } else if let Some(reason) = reply.strip_prefix("err") {
            Err(RigError::request_failed("Gantry", reason.trim()))
        } else {
            Err(RigError::unexpected("Gantry", reply))
        }
    }
}

#[async_trait]
impl DeviceAdapter for GantryAdapter {
    fn name(&self) -> &str {
        "Gantry"
    }

    async fn initialize(&self) -> AppResult<bool> {
        self.link.open(self.timeout).await?;
        info!("Gantry connected");
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        match command.action.as_str() {
            "move" => {
                let from = command.point_param("from")?;
                let to = command.point_param("to")?;
                self.move_bottle(from, to).await?;
                Ok(DeviceResponse::Ack)
            }
            other => Err(RigError::UnsupportedCommand {
                device: "Gantry".to_string(),
                action: other.to_string(),
            }),
        }
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.link.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Controller on a loopback port replying from `replies` in order.
    async fn spawn_controller(replies: Vec<&'static str>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            for reply in replies {
                match lines.next_line().await {
                    Ok(Some(line)) => seen.push(line),
                    _ => break,
                }
                write.write_all(format!("{reply}\r\n").as_bytes()).await.unwrap();
            }
            seen
        });
        (port, handle)
    }

    fn move_cmd() -> DeviceCommand {
        DeviceCommand::new("move")
            .with("from", vec![20.0, 20.0])
            .with("to", vec![300.0, 120.5])
    }

    #[tokio::test]
    async fn test_move_over_loopback() {
        let (port, controller) = spawn_controller(vec!["ok", "err collision"]).await;
        let gantry = GantryAdapter::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));

        assert!(gantry.initialize().await.unwrap());
        assert_eq!(gantry.execute(&move_cmd()).await.unwrap(), DeviceResponse::Ack);

        let err = gantry.execute(&move_cmd()).await.unwrap_err();
        match err {
            RigError::RequestFailed { device, message } => {
                assert_eq!(device, "Gantry");
                assert_eq!(message, "collision");
            }
            other => panic!("unexpected error: {other}"),
        }

        gantry.shutdown().await.unwrap();
        let seen = controller.await.unwrap();
        assert_eq!(seen[0], "move 20 20 300 120.5");
    }

    #[tokio::test]
    async fn test_unrecognized_reply() {
        let (port, _controller) = spawn_controller(vec!["busy"]).await;
        let gantry = GantryAdapter::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        gantry.initialize().await.unwrap();

        assert!(matches!(
            gantry.execute(&move_cmd()).await,
            Err(RigError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_requires_coordinates() {
        let (port, _controller) = spawn_controller(vec![]).await;
        let gantry = GantryAdapter::new("127.0.0.1", port);
        gantry.initialize().await.unwrap();

        let err = gantry
            .execute(&DeviceCommand::new("move").with("from", vec![1.0, 2.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::InvalidParameter(_)));
    }
}
