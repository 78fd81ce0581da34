pub mod status;

pub use status::StatusVariables;
