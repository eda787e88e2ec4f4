pub mod assignment;
pub mod errors;
pub mod evaluation;
pub mod inputs;

pub use assignment::*;
pub use errors::*;
pub use evaluation::*;
pub use inputs::*;
