pub mod cli;
pub mod repo_identifier;
pub mod state;
pub mod validation;
