//! Expression and predicate capabilities.
//!
//! Both are plain traits so callers can plug in anything that reads an
//! exchange. Closures work through [`expression_fn`] / [`predicate_fn`], and a
//! few stock expressions cover the common header/body/property lookups.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::exchange::Exchange;

/// Computes a value from an exchange.
pub trait Expression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Result<Value>;
}

/// Computes a boolean from an exchange.
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> Result<bool>;
}

pub type ExpressionRef = Arc<dyn Expression>;
pub type PredicateRef = Arc<dyn Predicate>;

struct FnExpression<F>(F);

impl<F> Expression for FnExpression<F>
where
    F: Fn(&Exchange) -> Result<Value> + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Result<Value> {
        (self.0)(exchange)
    }
}

struct FnPredicate<F>(F);

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Exchange) -> Result<bool> + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> Result<bool> {
        (self.0)(exchange)
    }
}

pub fn expression_fn<F>(f: F) -> ExpressionRef
where
    F: Fn(&Exchange) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnExpression(f))
}

pub fn predicate_fn<F>(f: F) -> PredicateRef
where
    F: Fn(&Exchange) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnPredicate(f))
}

pub fn body() -> ExpressionRef {
    expression_fn(|ex| Ok(ex.body().clone()))
}

/// Header of the current message, `null` when absent.
pub fn header(name: impl Into<String>) -> ExpressionRef {
    let name = name.into();
    expression_fn(move |ex| Ok(ex.header(&name).cloned().unwrap_or(Value::Null)))
}

/// Exchange property, `null` when absent.
pub fn property(name: impl Into<String>) -> ExpressionRef {
    let name = name.into();
    expression_fn(move |ex| Ok(ex.property(&name).cloned().unwrap_or(Value::Null)))
}

pub fn constant(value: impl Into<Value>) -> ExpressionRef {
    let value = value.into();
    expression_fn(move |_| Ok(value.clone()))
}

pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> PredicateRef {
    let name = name.into();
    let value = value.into();
    predicate_fn(move |ex| Ok(ex.header(&name) == Some(&value)))
}

pub fn body_equals(value: impl Into<Value>) -> PredicateRef {
    let value = value.into();
    predicate_fn(move |ex| Ok(ex.body() == &value))
}

pub fn not(predicate: PredicateRef) -> PredicateRef {
    predicate_fn(move |ex| predicate.matches(ex).map(|m| !m))
}

/// Predicate that is true when the expression yields a truthy value.
pub fn truthy(expression: ExpressionRef) -> PredicateRef {
    predicate_fn(move |ex| expression.evaluate(ex).map(|v| is_truthy(&v)))
}

/// `null`, `false`, `0` and empty strings/arrays are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Render a value as plain text: strings without quotes, `null` as empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
