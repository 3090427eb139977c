//! Cooperative cancellation of stage work that outlives its timeout.

mod token;

pub use token::CancellationToken;
