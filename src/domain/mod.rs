//! Domain layer - array capability ports and size units
//!
//! Reconcilers only ever talk to the array through [`ports::StorageBackend`],
//! so both wire protocols stay interchangeable behind one trait object.

pub mod ports;

pub use ports::*;
