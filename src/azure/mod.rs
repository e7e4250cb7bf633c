//! Azure management plane access: typed resource views, client traits and
//! the ARM REST implementation.

pub mod arm;
pub mod clients;
pub mod types;
