//! Arduino motion controller.
//!
//! The Arduino drives both turntables (`motor1` pump side, `motor2` measure
//! side) and the two probe cylinders (`cylinder1` UV-Vis, `cylinder2` DLS).
//! Every action is sent verbatim as a text line; the firmware answers with a
//! completion string such as `Motor1 Rotation Finished` once the motion is
//! done. That string is returned unchanged as [`DeviceResponse::Text`].

use crate::error::AppResult;
use crate::hardware::adapter::{DeviceAdapter, DeviceCommand, DeviceResponse};
use crate::hardware::transport::{DeviceLink, Endpoint, LineTransport};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Homing sequence run on initialize.
pub const HOMING_ACTIONS: [&str; 4] = [
    "motor1 home",
    "motor2 home",
    "cylinder1 home",
    "cylinder2 home",
];

/// Live Arduino adapter over a serial line.
pub struct ArduinoAdapter {
    link: DeviceLink,
    reply_timeout: Duration,
    settle: Duration,
    terminator: &'static str,
}

impl ArduinoAdapter {
    /// Adapter for the Arduino at `endpoint`.
    ///
    /// Defaults: 30 s reply timeout, 1 s settle after the port opens (the
    /// board resets when the port is opened), `\n` terminator.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::from_link(DeviceLink::new("Arduino", endpoint))
    }

    /// Adapter over an already connected transport.
    pub fn with_transport(transport: Box<dyn LineTransport>) -> Self {
        Self::from_link(DeviceLink::connected("Arduino", transport)).with_settle(Duration::ZERO)
    }

    fn from_link(link: DeviceLink) -> Self {
        Self {
            link,
            reply_timeout: Duration::from_secs(30),
            settle: Duration::from_secs(1),
            terminator: "\n",
        }
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the wait between opening the port and the first command.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    async fn send(&self, action: &str) -> AppResult<String> {
        let request = format!("{action}{}", self.terminator);
        let reply = self.link.request(request.as_bytes(), self.reply_timeout).await?;
        debug!(action, %reply, "Arduino replied");
        Ok(reply)
    }
}

#[async_trait]
impl DeviceAdapter for ArduinoAdapter {
    fn name(&self) -> &str {
        "Arduino"
    }

    async fn initialize(&self) -> AppResult<bool> {
        let was_open = self.link.is_open().await;
        self.link.open(self.reply_timeout).await?;
        if !was_open && !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }

        for action in HOMING_ACTIONS {
            self.send(action).await?;
        }
        info!("Arduino homed");
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        self.send(&command.action).await.map(DeviceResponse::Text)
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.link.close().await;
        Ok(())
    }
}
