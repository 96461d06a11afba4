//! Exclusive access to the half-duplex bus.
//!
//! [`Transport`] is the raw byte stream, [`Session`] adds request/response
//! matching with retry-until-valid semantics on top of it.

use crate::error::Result;
use crate::protocol::{self as proto, Frame};
use crate::shutdown::Shutdown;
use log::*;

/// A half-duplex, ordered byte stream without framing.
pub trait Transport {
    /// Writes a complete frame to the line.
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Reads whatever the device sends until the line goes quiet.
    ///
    /// Returns an empty buffer if nothing arrives within the read timeout.
    fn read_available(&mut self) -> std::io::Result<Vec<u8>>;
}

/// Owns the transport and performs validated request/response exchanges.
#[derive(Debug)]
pub struct Session<T> {
    transport: T,
    shutdown: Shutdown,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, shutdown: Shutdown) -> Self {
        Self {
            transport,
            shutdown,
        }
    }

    /// Sends `frame` until the device answers with a valid, matching response.
    ///
    /// Every attempt is one write followed by one read. There is no retry
    /// limit; the loop ends with `Ok(None)` as soon as shutdown is observed
    /// before an attempt. Only I/O failures of the transport are returned as
    /// errors.
    pub fn exchange(&mut self, frame: &Frame) -> Result<Option<Vec<u16>>> {
        let count = frame.response_words();
        let mut attempt: u64 = 0;
        while !self.shutdown.is_triggered() {
            attempt += 1;
            debug!("Sending frame: {}", hex::encode(frame.as_bytes()));
            self.transport.write_frame(frame.as_bytes())?;

            let response = self.transport.read_available()?;
            debug!("Response frame: {}", hex::encode(&response));
            match proto::parse_response(&response, frame.header(), count) {
                Ok(words) => {
                    if attempt > 1 {
                        debug!("Valid response after {attempt} attempts");
                    }
                    return Ok(Some(words));
                }
                Err(error) => debug!("Response frame rejected, retrying: {error}"),
            }
        }
        debug!("Exchange cancelled after {attempt} attempts");
        Ok(None)
    }

    /// Gives the transport back, e.g. to close it explicitly.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(feature = "serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
pub use self::serial::{serial_port_builder, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use super::Transport;
    use std::io::{ErrorKind, Read, Write};
    use std::time::Duration;

    /// The parity used for serial communication.
    pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
    /// The number of stop bits used for serial communication.
    pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
    /// The number of data bits used for serial communication.
    pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

    /// Creates a `tokio_serial::SerialPortBuilder` with the EMS line settings.
    ///
    /// # Arguments
    ///
    /// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
    /// * `baud_rate` - The baud rate for the serial communication.
    /// * `timeout` - How long a read waits for the next byte.
    pub fn serial_port_builder(
        device: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(device, baud_rate)
            .parity(*PARITY)
            .stop_bits(*STOP_BITS)
            .data_bits(*DATA_BITS)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout)
    }

    /// A blocking RS485 serial port.
    pub struct SerialTransport {
        port: Box<dyn tokio_serial::SerialPort>,
    }

    impl std::fmt::Debug for SerialTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SerialTransport")
                .field("port", &self.port.name())
                .finish()
        }
    }

    impl SerialTransport {
        /// Opens the serial port described by `builder`.
        pub fn open(builder: &tokio_serial::SerialPortBuilder) -> crate::error::Result<Self> {
            let port = builder.clone().open()?;
            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.port.write_all(frame)?;
            self.port.flush()
        }

        fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
            let mut response = Vec::new();
            let mut buffer = [0u8; 256];
            loop {
                match self.port.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(read) => response.extend_from_slice(&buffer[..read]),
                    Err(error) if error.kind() == ErrorKind::TimedOut => break,
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => return Err(error),
                }
            }
            Ok(response)
        }
    }
}
