pub mod java;
pub mod rust;
