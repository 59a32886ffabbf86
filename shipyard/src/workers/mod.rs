//! Background workers

pub mod sweeper;
