//! External commands and their pending state.
//!
//! The MQTT event pump hands inbound messages to [`CommandIntake`], which
//! validates them and records them in [`PendingCommands`]. The scheduler
//! picks them up from there, one per cycle.

use crate::register::topic_prefix;
use log::*;
use std::fmt;
use std::sync::Mutex;

/// Highest accepted power limit in watts.
pub const POWER_LIMIT_MAX: u16 = 1600;

/// The three settings that can be changed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Energy meter usage on/off.
    Em,
    /// Bypass on/off.
    Bypass,
    /// Feed-in power limit in watts.
    PowerLimit,
}

impl CommandKind {
    /// All kinds in service priority order.
    pub const ALL: [CommandKind; 3] = [CommandKind::Em, CommandKind::Bypass, CommandKind::PowerLimit];

    /// The register the command writes to.
    pub const fn register(&self) -> u16 {
        match self {
            CommandKind::Em => 0x303B,
            CommandKind::Bypass => 0x3039,
            CommandKind::PowerLimit => 0x302E,
        }
    }

    /// Topic suffix the command is received on.
    pub const fn topic_suffix(&self) -> &'static str {
        match self {
            CommandKind::Em => "EMS_EM/turn",
            CommandKind::Bypass => "EMS_Bypass/turn",
            CommandKind::PowerLimit => "EMS_Power_Limit/set",
        }
    }

    /// Full command topic for the EMS with the given id.
    pub fn topic(&self, ems_id: &str) -> String {
        format!("{}/{}", topic_prefix(ems_id), self.topic_suffix())
    }

    const fn index(&self) -> usize {
        match self {
            CommandKind::Em => 0,
            CommandKind::Bypass => 1,
            CommandKind::PowerLimit => 2,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandKind::Em => "EMS_EM",
            CommandKind::Bypass => "EMS_Bypass",
            CommandKind::PowerLimit => "EMS_Power_Limit",
        })
    }
}

/// Reasons an inbound command is discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("no command is bound to topic '{0}'")]
    UnknownTopic(String),
    #[error("invalid switch payload '{0}', expected 'on' or 'off'")]
    InvalidSwitch(String),
    #[error("invalid power limit '{0}', expected a decimal integer")]
    InvalidPowerLimit(String),
    #[error("power limit {0} W is outside 0..=1600 W")]
    PowerLimitOutOfRange(i64),
}

/// A validated command waiting to be written to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub value: u16,
    sequence: u64,
}

fn parse_switch(payload: &str) -> Result<u16, CommandError> {
    match payload {
        "on" => Ok(1),
        "off" => Ok(0),
        other => Err(CommandError::InvalidSwitch(other.to_string())),
    }
}

fn parse_power_limit(payload: &str) -> Result<u16, CommandError> {
    let watts: i64 = payload
        .trim()
        .parse()
        .map_err(|_| CommandError::InvalidPowerLimit(payload.to_string()))?;
    if (0..=i64::from(POWER_LIMIT_MAX)).contains(&watts) {
        Ok(watts as u16)
    } else {
        Err(CommandError::PowerLimitOutOfRange(watts))
    }
}

/// Validates a payload for the given command kind and returns the register value.
pub fn parse_payload(kind: CommandKind, payload: &str) -> Result<u16, CommandError> {
    match kind {
        CommandKind::Em | CommandKind::Bypass => parse_switch(payload),
        CommandKind::PowerLimit => parse_power_limit(payload),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    value: u16,
    dirty: bool,
    sequence: u64,
}

/// One last-writer-wins slot per command kind.
#[derive(Debug, Default)]
pub struct PendingCommands {
    slots: [Mutex<Slot>; 3],
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: CommandKind) -> std::sync::MutexGuard<'_, Slot> {
        self.slots[kind.index()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Records a new value, replacing any unserviced one of the same kind.
    pub fn submit(&self, kind: CommandKind, value: u16) {
        let mut slot = self.slot(kind);
        slot.value = value;
        slot.dirty = true;
        slot.sequence = slot.sequence.wrapping_add(1);
    }

    /// The highest priority dirty command, if any. Does not clear it.
    pub fn next_dirty(&self) -> Option<PendingCommand> {
        CommandKind::ALL.into_iter().find_map(|kind| {
            let slot = self.slot(kind);
            slot.dirty.then_some(PendingCommand {
                kind,
                value: slot.value,
                sequence: slot.sequence,
            })
        })
    }

    /// Clears the dirty flag if no newer value was submitted meanwhile.
    ///
    /// Returns `false` if a newer command is still pending.
    pub fn acknowledge(&self, command: &PendingCommand) -> bool {
        let mut slot = self.slot(command.kind);
        if slot.dirty && slot.sequence == command.sequence {
            slot.dirty = false;
            true
        } else {
            false
        }
    }

    /// Whether a command of `kind` waits to be serviced.
    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.slot(kind).dirty
    }
}

/// Routes inbound MQTT messages of one EMS to [`PendingCommands`].
#[derive(Debug, Clone)]
pub struct CommandIntake {
    ems_id: String,
}

impl CommandIntake {
    pub fn new(ems_id: impl Into<String>) -> Self {
        Self {
            ems_id: ems_id.into(),
        }
    }

    /// The topics to subscribe to.
    pub fn topics(&self) -> Vec<String> {
        CommandKind::ALL
            .iter()
            .map(|kind| kind.topic(&self.ems_id))
            .collect()
    }

    /// Validates a message without touching any pending state.
    pub fn parse(&self, topic: &str, payload: &str) -> Result<(CommandKind, u16), CommandError> {
        let kind = CommandKind::ALL
            .into_iter()
            .find(|kind| kind.topic(&self.ems_id) == topic)
            .ok_or_else(|| CommandError::UnknownTopic(topic.to_string()))?;
        Ok((kind, parse_payload(kind, payload)?))
    }

    /// Validates a message and records it. Invalid messages are logged and ignored.
    pub fn handle(&self, pending: &PendingCommands, topic: &str, payload: &str) {
        match self.parse(topic, payload) {
            Ok((kind, value)) => {
                pending.submit(kind, value);
                info!("{kind} change to {value} is set");
            }
            Err(error) => info!("Ignoring message on {topic}: {error}"),
        }
    }
}
