pub mod access;
pub mod alias;
