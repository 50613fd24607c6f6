pub mod bybit;

pub use bybit::BybitClient;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("venue rejected request: retCode {code}: {message}")]
    Api { code: i64, message: String },
    #[error("venue response missing {0}")]
    MissingData(&'static str),
    #[error("order quantity {0} rounds to zero at step {1}")]
    ZeroQuantity(f64, f64),
}
