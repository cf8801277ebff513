//! Quote generation and the order lifecycle state machine.

mod controller;
mod generator;

pub use controller::{
    ControllerHandle, OrderApi, QuoteController, QuoteSide, RebalanceTrigger, SideState,
};
pub use generator::generate_quotes;
