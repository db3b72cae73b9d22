mod error;
mod models;
mod parser;

pub use error::*;
pub use models::*;
pub use parser::{parse, parse_invoice};
