//! The okada dispatch server binary's library half: configuration,
//! dependency assembly, the socket gateway, and the run loop.

pub mod cli;
pub mod context;
pub mod gateway;
pub mod run;
