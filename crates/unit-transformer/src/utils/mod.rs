//! Utility modules

pub mod init;
pub mod linear_algebra;
pub mod masks;
pub mod shape;
pub mod tensor_ops;

pub use masks::*;
