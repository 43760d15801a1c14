//! Domain types for the conveyor run execution engine.

mod ids;
mod models;
mod snapshot;
mod status;

pub use self::ids::*;
pub use self::models::*;
pub use self::snapshot::*;
pub use self::status::*;
