pub mod control;
pub mod state;
pub mod worker;
