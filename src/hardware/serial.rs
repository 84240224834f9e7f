//! Real serial port transport backed by `tokio-serial`.
//!
//! Only compiled with the `serial` feature.

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use super::transport::{LinkHalves, SerialTransport, StreamLink};
use crate::config::SerialConfig;
use crate::error::{RigError, RigResult};

/// Serial port transport for the motion controller.
///
/// 8N1, no flow control, as expected by GRBL-family controllers.
#[derive(Debug, Clone)]
pub struct SerialPortTransport {
    port: String,
    baud_rate: u32,
}

impl SerialPortTransport {
    /// Transport for `port` at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }

    /// Transport for the configured port and baud rate.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
    }
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn open(&self) -> RigResult<LinkHalves> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                RigError::ConnectionLost(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port, self.baud_rate, e
                ))
            })?;

        debug!(port = %self.port, baud = self.baud_rate, "serial port opened");
        Ok(StreamLink::split(stream))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }
}
