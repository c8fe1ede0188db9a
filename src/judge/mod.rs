//! Language adapters.
//!
//! The pipeline core stays language-agnostic. Adapters define the harness
//! template, compile/run commands and envelope profiles for each language.

pub mod adapter;
pub mod languages;
pub mod registry;
pub mod screen;

pub use adapter::LanguageAdapter;
pub use registry::adapter_for;
