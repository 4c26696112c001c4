//! Wire models of the evaluation, status and statistics streams.

mod evaluation;
mod evaluation_ext;

pub use evaluation::*;
