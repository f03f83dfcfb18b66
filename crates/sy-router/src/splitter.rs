//! Splitter: breaks one exchange into many and runs a sub-route per element.
//!
//! Elements come from a `SplitExpression` as a lazy iterator. In streaming
//! mode elements are pulled one at a time and the total size is only known
//! at the end; otherwise the iterator is collected up front. Each element
//! exchange carries its index, a completion flag that is true only on the
//! last element, and (when known) the total size.

use std::iter::Peekable;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sy_common::constants::{SPLIT_COMPLETE, SPLIT_INDEX, SPLIT_SIZE};
use sy_common::expression::value_to_string;
use sy_common::{Exchange, ExpressionRef, Result};

use crate::multicast::{Branch, FanOut};
use crate::processor::{Processor, ProcessorRef};

pub type SplitIter = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Produces the elements to split an exchange into.
pub trait SplitExpression: Send + Sync {
    fn split(&self, exchange: &Exchange) -> Result<SplitIter>;
}

pub type SplitExpressionRef = Arc<dyn SplitExpression>;

/// Splits the value of an expression: arrays by element, strings on commas,
/// `null` into nothing, anything else into itself.
pub struct ExpressionSplit {
    expression: ExpressionRef,
}

impl ExpressionSplit {
    pub fn new(expression: ExpressionRef) -> Self {
        Self { expression }
    }
}

impl SplitExpression for ExpressionSplit {
    fn split(&self, exchange: &Exchange) -> Result<SplitIter> {
        Ok(match self.expression.evaluate(exchange)? {
            Value::Null => Box::new(std::iter::empty()),
            Value::Array(items) => Box::new(items.into_iter().map(Ok)),
            Value::String(s) => Box::new(Tokens::new(s, ",".to_string()).map(|t| Ok(Value::String(t)))),
            other => Box::new(std::iter::once(Ok(other))),
        })
    }
}

/// Lazily tokenizes the text of an expression on a separator.
pub struct Tokenizer {
    expression: ExpressionRef,
    token: String,
}

impl Tokenizer {
    pub fn new(expression: ExpressionRef, token: impl Into<String>) -> Self {
        Self {
            expression,
            token: token.into(),
        }
    }
}

impl SplitExpression for Tokenizer {
    fn split(&self, exchange: &Exchange) -> Result<SplitIter> {
        let text = value_to_string(&self.expression.evaluate(exchange)?);
        Ok(Box::new(Tokens::new(text, self.token.clone()).map(|t| Ok(Value::String(t)))))
    }
}

/// Owning token iterator; skips empty tokens.
struct Tokens {
    text: String,
    token: String,
    position: usize,
}

impl Tokens {
    fn new(text: String, token: String) -> Self {
        Self { text, token, position: 0 }
    }
}

impl Iterator for Tokens {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.position <= self.text.len() {
            let rest = &self.text[self.position..];
            let (piece, advance) = match (self.token.is_empty(), rest.find(&self.token)) {
                (false, Some(at)) => (&rest[..at], at + self.token.len()),
                _ => (rest, rest.len() + 1),
            };
            let piece = piece.to_string();
            self.position += advance;
            if !piece.is_empty() {
                return Some(piece);
            }
        }
        None
    }
}

struct SplitFn<F>(F);

impl<F> SplitExpression for SplitFn<F>
where
    F: Fn(&Exchange) -> Result<SplitIter> + Send + Sync,
{
    fn split(&self, exchange: &Exchange) -> Result<SplitIter> {
        (self.0)(exchange)
    }
}

pub fn split_fn<F>(f: F) -> SplitExpressionRef
where
    F: Fn(&Exchange) -> Result<SplitIter> + Send + Sync + 'static,
{
    Arc::new(SplitFn(f))
}

/// Turns split elements into fan-out branches, looking one element ahead to
/// flag the last one.
struct SplitBranches {
    items: Peekable<SplitIter>,
    index: usize,
    size: Option<usize>,
    processor: ProcessorRef,
}

impl Iterator for SplitBranches {
    type Item = Result<Branch>;

    fn next(&mut self) -> Option<Result<Branch>> {
        let value = match self.items.next()? {
            Ok(value) => value,
            Err(e) => return Some(Err(e)),
        };
        let last = self.items.peek().is_none();
        let index = self.index;
        self.index += 1;

        let mut properties = vec![(SPLIT_INDEX, json!(index)), (SPLIT_COMPLETE, json!(last))];
        match self.size {
            Some(size) => properties.push((SPLIT_SIZE, json!(size))),
            None if last => properties.push((SPLIT_SIZE, json!(index + 1))),
            None => {}
        }

        Some(Ok(Branch {
            processor: self.processor.clone(),
            body: Some(value),
            properties,
        }))
    }
}

pub struct Splitter {
    expression: SplitExpressionRef,
    processor: ProcessorRef,
    fan_out: FanOut,
    streaming: bool,
}

impl Splitter {
    pub fn new(expression: SplitExpressionRef, processor: ProcessorRef, fan_out: FanOut) -> Self {
        Self {
            expression,
            processor,
            fan_out,
            streaming: false,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

#[async_trait]
impl Processor for Splitter {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let items = self.expression.split(exchange)?;

        let (items, size): (SplitIter, Option<usize>) = if self.streaming {
            (items, None)
        } else {
            let collected = items.collect::<Result<Vec<Value>>>()?;
            let size = collected.len();
            (Box::new(collected.into_iter().map(Ok)), Some(size))
        };

        let branches = SplitBranches {
            items: items.peekable(),
            index: 0,
            size,
            processor: self.processor.clone(),
        };
        self.fan_out.run(exchange, branches).await
    }
}
