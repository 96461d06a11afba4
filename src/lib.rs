//! A library bridging an EMS (Energy Management System) on an RS485 bus to a
//! publish/subscribe message bus.
//!
//! The EMS speaks a Modbus-like binary protocol with a `0xA5 0x5A` boot
//! marker. This crate provides the pieces to talk to it and to turn its
//! registers into individual facts:
//!
//! 1.  **Frame codec** ([`protocol`]): CRC16, request frames and response
//!     validation.
//! 2.  **Register map** ([`register`]): scaling, signedness, labels, 32-bit
//!     register pairs and topic names.
//! 3.  **Bus engine** ([`transport`], [`scheduler`]): an exclusive session
//!     that retries each request until the device answers correctly, and the
//!     state machine interleaving telemetry reads, diagnostic reads and
//!     command writes.
//! 4.  **Hand-off** ([`publisher`], [`command`]): the publisher draining
//!     decoded facts and the intake turning inbound commands into pending
//!     register writes.
//!
//! All long-running parts observe one [`shutdown::Shutdown`] token.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ems_rs485_lib::{
//!     command::PendingCommands,
//!     protocol::Address,
//!     scheduler::Scheduler,
//!     shutdown::Shutdown,
//!     transport::{serial_port_builder, SerialTransport, Session},
//! };
//! use std::sync::{mpsc, Arc};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shutdown = Shutdown::new();
//!     let builder = serial_port_builder("/dev/ttyUSB0", 9600, Duration::from_millis(200));
//!     let transport = SerialTransport::open(&builder)?;
//!     let (tx, rx) = mpsc::channel();
//!
//!     let mut scheduler = Scheduler::new(
//!         Session::new(transport, shutdown.clone()),
//!         Address::default(),
//!         Arc::new(PendingCommands::new()),
//!         tx,
//!         shutdown,
//!     );
//!     scheduler.cycle()?;
//!     for fact in rx.try_iter() {
//!         println!("{:#06x}: {}", fact.address, fact.value);
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod command;
mod error;
pub mod protocol;
pub mod publisher;
pub mod register;
pub mod scheduler;
pub mod shutdown;
pub mod transport;

pub use error::{Error, Result};
