pub mod deltas;
pub mod events;

pub use deltas::*;
pub use events::*;
