//! The poll/command state machine.
//!
//! Each cycle reads the telemetry block, services at most one pending
//! command and reads one of five diagnostic blocks in rotation. Decoded
//! facts are pushed into the queue drained by the publisher.

use crate::command::{PendingCommand, PendingCommands};
use crate::error::Result;
use crate::protocol::{self as proto, Address, RegisterRange};
use crate::register::{self, DecodedFact};
use crate::shutdown::Shutdown;
use crate::transport::{Session, Transport};
use log::*;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

/// Temperature and MPPT block, read every cycle.
pub const TELEMETRY: RegisterRange = RegisterRange::new(0x4001, 0x0010);
/// EMS settings, also read back after every command.
pub const EMS_SETTINGS: RegisterRange = RegisterRange::new(0x302D, 0x000F);
pub const BATTERY_SETTINGS: RegisterRange = RegisterRange::new(0x301F, 0x000E);
pub const BATTERY_EMS_INFO: RegisterRange = RegisterRange::new(0x4016, 0x000C);
pub const CT_INFO: RegisterRange = RegisterRange::new(0x3022, 0x000C);
pub const BATTERY_CT_INFO: RegisterRange = RegisterRange::new(0x303A, 0x0009);

/// Read after a command write to publish the new settings.
pub const COMMAND_CONFIRMATION: RegisterRange = RegisterRange::new(0x302E, 0x0010);

/// Diagnostic blocks, one per cycle.
pub const DIAGNOSTIC_ROTATION: [RegisterRange; 5] = [
    EMS_SETTINGS,
    BATTERY_SETTINGS,
    BATTERY_EMS_INFO,
    CT_INFO,
    BATTERY_CT_INFO,
];

/// Outcome of a single scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Completed,
    Cancelled,
}

/// Drives the bus. Owns the transport session exclusively.
pub struct Scheduler<T> {
    session: Session<T>,
    device: Address,
    pending: Arc<PendingCommands>,
    facts: Sender<DecodedFact>,
    shutdown: Shutdown,
    sequence: usize,
    poll_interval: Duration,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(
        session: Session<T>,
        device: Address,
        pending: Arc<PendingCommands>,
        facts: Sender<DecodedFact>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            session,
            device,
            pending,
            facts,
            shutdown,
            sequence: 0,
            poll_interval: Duration::ZERO,
        }
    }

    /// Pause between two cycles.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Index of the diagnostic block read in the next cycle.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Runs cycles until shutdown. A transport failure raises shutdown and is returned.
    pub fn run(mut self) -> Result<T> {
        info!("Scheduler started for device {}", self.device);
        while !self.shutdown.is_triggered() {
            match self.cycle() {
                Ok(Step::Completed) => {
                    if !self.poll_interval.is_zero() {
                        self.shutdown.sleep(self.poll_interval);
                    }
                }
                Ok(Step::Cancelled) => break,
                Err(error) => {
                    self.shutdown.trigger();
                    return Err(error);
                }
            }
        }
        info!("Scheduler stopped");
        Ok(self.session.into_inner())
    }

    /// One full cycle: telemetry, optional command, one diagnostic block.
    pub fn cycle(&mut self) -> Result<Step> {
        if self.poll(TELEMETRY)? == Step::Cancelled {
            return Ok(Step::Cancelled);
        }

        if let Some(command) = self.pending.next_dirty() {
            if self.service(&command)? == Step::Cancelled {
                return Ok(Step::Cancelled);
            }
        }

        let diagnostic = DIAGNOSTIC_ROTATION[self.sequence];
        self.sequence = (self.sequence + 1) % DIAGNOSTIC_ROTATION.len();
        self.poll(diagnostic)
    }

    /// Reads `range` and queues every decoded fact.
    fn poll(&mut self, range: RegisterRange) -> Result<Step> {
        let frame = proto::build_read_frame(self.device, range.address, range.quantity);
        let Some(words) = self.session.exchange(&frame)? else {
            return Ok(Step::Cancelled);
        };
        for fact in register::decode(range.address, &words) {
            trace!("Decoded {:#06x}: {}", fact.address, fact.value);
            if self.facts.send(fact).is_err() {
                debug!("Fact queue closed, publisher has stopped");
            }
        }
        Ok(Step::Completed)
    }

    /// Writes a command and reads back the settings block.
    fn service(&mut self, command: &PendingCommand) -> Result<Step> {
        let register = command.kind.register();
        let frame = proto::build_write_frame(self.device, register, 1, &[command.value]);
        if self.session.exchange(&frame)?.is_none() {
            return Ok(Step::Cancelled);
        }
        if self.shutdown.is_triggered() {
            return Ok(Step::Cancelled);
        }
        if self.poll(COMMAND_CONFIRMATION)? == Step::Cancelled {
            return Ok(Step::Cancelled);
        }
        if self.pending.acknowledge(command) {
            info!("{} changed successfully to {}", command.kind, command.value);
        } else {
            debug!("{} was updated while being written", command.kind);
        }
        Ok(Step::Completed)
    }
}
