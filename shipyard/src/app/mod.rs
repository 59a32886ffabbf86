//! Application runtime

pub mod options;
pub mod run;
pub mod state;
