pub mod trading;
pub mod candle;
pub mod market;
pub mod position;
pub mod verdict;

pub use trading::*;
pub use candle::*;
pub use market::*;
pub use position::*;
pub use verdict::*;
