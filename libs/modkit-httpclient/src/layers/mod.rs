//! Tower layers of the hyper transport stack

mod exchange;

pub use exchange::{ExchangeLayer, ExchangeService};
