pub mod clock;
pub mod schedule;
pub mod types;
pub mod value;

pub use clock::*;
pub use schedule::*;
pub use types::*;
pub use value::*;
