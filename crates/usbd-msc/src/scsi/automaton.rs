//! SCSI command automaton.
//!
//! Every dequeued command is checked against a per-state transition
//! table before its handler runs. The table is searched in order and the
//! first match wins; an opcode with no entry for the current state is an
//! invalid transition, answered with CHECK CONDITION and a move to
//! [`ScsiState::Error`].

use thiserror::Error;

use crate::scsi::cdb::*;

/// Automaton states. `Read` and `Write` are transient: they are entered
/// for the duration of a streaming data phase and left on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScsiState {
    Idle = 0x00,
    Read = 0x01,
    Write = 0x02,
    Error = 0x03,
}

/// A command that is not allowed in the current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("opcode {opcode:#04x} is not a valid transition from {state:?}")]
pub struct InvalidTransition {
    pub state: ScsiState,
    pub opcode: u8,
}

/// Commands acceptable while Idle. All of them complete back in Idle
/// except the streaming ones, which move through Read/Write.
const FROM_IDLE: &[(u8, ScsiState)] = &[
    (TEST_UNIT_READY, ScsiState::Idle),
    (REQUEST_SENSE, ScsiState::Idle),
    (INQUIRY, ScsiState::Idle),
    (MODE_SELECT_6, ScsiState::Idle),
    (MODE_SELECT_10, ScsiState::Idle),
    (MODE_SENSE_6, ScsiState::Idle),
    (MODE_SENSE_10, ScsiState::Idle),
    (SEND_DIAGNOSTIC, ScsiState::Idle),
    (PREVENT_ALLOW_MEDIUM_REMOVAL, ScsiState::Idle),
    (READ_FORMAT_CAPACITIES, ScsiState::Idle),
    (READ_CAPACITY_10, ScsiState::Idle),
    (READ_CAPACITY_16, ScsiState::Idle),
    (REPORT_LUNS, ScsiState::Idle),
    (READ_6, ScsiState::Read),
    (READ_10, ScsiState::Read),
    (WRITE_6, ScsiState::Write),
    (WRITE_10, ScsiState::Write),
];

/// Mid-stream, only the same streaming opcode may continue.
const FROM_READ: &[(u8, ScsiState)] = &[(READ_10, ScsiState::Read)];
const FROM_WRITE: &[(u8, ScsiState)] = &[(WRITE_10, ScsiState::Write)];

/// The only exits from Error: the host asking what went wrong.
const FROM_ERROR: &[(u8, ScsiState)] = &[
    (MODE_SENSE_10, ScsiState::Idle),
    (REQUEST_SENSE, ScsiState::Idle),
];

fn table_for(state: ScsiState) -> &'static [(u8, ScsiState)] {
    match state {
        ScsiState::Idle => FROM_IDLE,
        ScsiState::Read => FROM_READ,
        ScsiState::Write => FROM_WRITE,
        ScsiState::Error => FROM_ERROR,
    }
}

/// Look up the state the automaton moves to when `opcode` arrives in
/// `state`. First matching entry wins.
pub fn next_state(state: ScsiState, opcode: u8) -> Result<ScsiState, InvalidTransition> {
    table_for(state)
        .iter()
        .find(|(op, _)| *op == opcode)
        .map(|(_, next)| *next)
        .ok_or(InvalidTransition { state, opcode })
}

/// Convenience predicate used by diagnostics and tests.
pub fn is_valid_transition(state: ScsiState, opcode: u8) -> bool {
    next_state(state, opcode).is_ok()
}
