//! Corral DNS Infrastructure Layer
pub mod catalog;
pub mod dns;
