//! Domain model module declarations.

pub mod attempt;
pub mod record;
