mod backoff;
mod error;
mod model;
mod state;
mod types;

pub use backoff::*;
pub use error::*;
pub use model::*;
pub use state::*;
pub use types::*;
