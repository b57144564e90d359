//! The synchronization engine: the worker state machine, inbound sync
//! application, and server command handling.

pub mod apply;
pub mod commands;
pub mod fsm;
pub mod worker;

pub use fsm::{Fsm, FsmEvent, State};
pub use worker::Worker;
