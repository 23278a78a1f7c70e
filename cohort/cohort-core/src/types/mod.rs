//! Core data model: type definitions, instances, properties and membership.

pub mod instance;
pub mod member;
pub mod properties;
pub mod search;
pub mod typedef;

pub use instance::*;
pub use member::*;
pub use properties::*;
pub use search::*;
pub use typedef::*;
