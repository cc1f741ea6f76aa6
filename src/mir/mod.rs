pub mod analyze;
pub mod def;
pub mod display;
pub mod opt;
pub mod verify;

#[allow(unused_imports)]
pub use def::*;
