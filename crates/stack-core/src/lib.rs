pub mod action;
pub mod config;
pub mod error;
pub mod expr;
pub mod git;
pub mod io;
pub mod libs;
pub mod output;
pub mod paths;
pub mod process;
pub mod runtime;
pub mod signals;
pub mod status;
pub mod unit;
pub mod value;
pub mod vars;

pub use error::{Result, StackError};
pub use runtime::{Runtime, Settings};
pub use unit::Unit;
