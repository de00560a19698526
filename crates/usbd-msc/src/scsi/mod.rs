//! SCSI command layer: CDB decoding, the command automaton, sense data
//! and response payload builders.

pub mod automaton;
pub mod cdb;
pub mod response;
pub mod sense;
