//! Switchyard Common Types
//!
//! The exchange model shared by every crate in the workspace:
//! - `Exchange` / `Message` / `Fault`: the unit of routing and its payloads
//! - `ExchangeError`: the single failure taxonomy carried on an exchange
//! - `Expression` / `Predicate`: pluggable evaluation capabilities
//! - `UnitOfWork` / `Synchronization`: completion callbacks for a whole exchange
//! - `MessageHistory`: the per-exchange node trace
//! - `constants`: well-known property and header names

pub mod constants;
pub mod error;
pub mod exchange;
pub mod expression;
pub mod history;
pub mod message;
pub mod unit_of_work;

pub use error::{ExchangeError, Result};
pub use exchange::{Exchange, ExchangePattern, Outcome};
pub use expression::{Expression, ExpressionRef, Predicate, PredicateRef};
pub use history::{HistoryEntry, MessageHistory};
pub use message::{Fault, Message};
pub use unit_of_work::{Synchronization, UnitOfWork};

pub use serde_json::{json, Value};
