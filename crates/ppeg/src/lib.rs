//! Parsing expression grammar matching engine.
//!
//! Patterns are built with [`Pattern`] constructors and operators, compiled
//! into a [`Program`] and run by a backtracking [`ParsingMachine`].
//!
//! ```
//! use ppeg::{Pattern, Value};
//!
//! let digit = Pattern::range("09").unwrap();
//! let number = digit.rep(1).capture();
//! let list = number.clone() + (Pattern::literal(",") + number).rep(0);
//!
//! let m = list.matches("1,22,333").unwrap().unwrap();
//! assert_eq!(m.end(), 8);
//! assert_eq!(m.captures(), &[Value::from("1"), Value::from("22"), Value::from("333")]);
//! ```

mod error;
mod grammar;
mod parsing_machine;
mod pattern;
mod value;

pub use error::PegError;
pub use grammar::{Grammar, RuleKey};
pub use parsing_machine::{CaptureKind, Match, Options, ParsingMachine, Program};
pub use pattern::{FoldFn, MapFn, MatchFn, Pattern, QueryTable, RuntimeFn};
pub use value::Value;
