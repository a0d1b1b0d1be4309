pub mod cli;
pub mod passes;
