pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payer;
pub mod pipeline;
pub mod quote_engine;

pub use error::{AppError, AppResult};
