pub mod error;
pub mod mir;
