//! Miscellaneous common structs used throughout the library.

mod contact;
mod introset;
mod key;
pub mod messages;
mod routing_table;

pub use contact::*;
pub use introset::*;
pub use key::*;
pub use messages::*;
pub use routing_table::*;
