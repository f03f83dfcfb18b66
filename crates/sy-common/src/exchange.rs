use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{CONTROL_PROPERTIES, CORRELATION_ID, FAILURE_PROPERTIES};
use crate::error::ExchangeError;
use crate::history::MessageHistory;
use crate::message::{Fault, Message};
use crate::unit_of_work::UnitOfWork;

// ============================================================================
// Exchange
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangePattern {
    /// Fire and forget
    #[default]
    InOnly,
    /// Request/reply: the caller reads the resulting message
    InOut,
}

/// How an exchange finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome<'a> {
    Completed,
    Fault(&'a Fault),
    Failed(&'a ExchangeError),
}

/// The unit of routing: an inbound message, an optional outbound message,
/// properties, an optional attached failure and the node history.
///
/// Processors mutate the exchange in place. Fan-out patterns work on
/// independent copies made with [`Exchange::copy_for_branch`]; a copy never
/// shares mutable message state with its source, only the unit of work.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    properties: HashMap<String, Value>,
    exception: Option<ExchangeError>,
    caught_exception: Option<ExchangeError>,
    history: MessageHistory,
    unit_of_work: Option<Arc<UnitOfWork>>,
    created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: ExchangePattern::InOnly,
            in_message: message,
            out_message: None,
            properties: HashMap::new(),
            exception: None,
            caught_exception: None,
            history: MessageHistory::default(),
            unit_of_work: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_body(body: impl Into<Value>) -> Self {
        Self::new(Message::new(body))
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in(&mut self, message: Message) {
        self.in_message = message;
    }

    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn set_out(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn clear_out(&mut self) {
        self.out_message = None;
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    /// The current message: the out message when one was produced, else the in message.
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match self.out_message {
            Some(ref mut out) => out,
            None => &mut self.in_message,
        }
    }

    pub fn body(&self) -> &Value {
        &self.message().body
    }

    pub fn body_str(&self) -> Option<&str> {
        self.message().body_str()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message_mut().set_body(body);
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message().header(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.message_mut().set_header(name, value);
    }

    /// Promote the out message (if any) to be the in message of the next step.
    pub fn prepare_next(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_bool(&self, name: &str) -> bool {
        self.properties.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    // ------------------------------------------------------------------------
    // Failure state
    // ------------------------------------------------------------------------

    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, error: ExchangeError) {
        self.exception = Some(error);
    }

    pub fn take_exception(&mut self) -> Option<ExchangeError> {
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// The last exception an error handler or catch block dealt with.
    pub fn caught_exception(&self) -> Option<&ExchangeError> {
        self.caught_exception.as_ref()
    }

    pub fn set_caught_exception(&mut self, error: ExchangeError) {
        self.caught_exception = Some(error);
    }

    /// Drop the attached exception together with the flags that only make
    /// sense while it is attached.
    pub fn clear_failure_state(&mut self) {
        self.exception = None;
        for name in FAILURE_PROPERTIES {
            self.properties.remove(*name);
        }
    }

    /// Attach another exchange's failure (exception plus its exhaustion flags).
    pub fn propagate_failure_from(&mut self, other: &Exchange) {
        if let Some(error) = other.exception() {
            self.exception = Some(error.clone());
        }
        if let Some(caught) = other.caught_exception() {
            self.caught_exception = Some(caught.clone());
        }
        for name in FAILURE_PROPERTIES {
            if let Some(value) = other.property(name) {
                self.properties.insert((*name).to_string(), value.clone());
            }
        }
    }

    pub fn outcome(&self) -> Outcome<'_> {
        if let Some(error) = &self.exception {
            return Outcome::Failed(error);
        }
        match &self.message().fault {
            Some(fault) => Outcome::Fault(fault),
            None => Outcome::Completed,
        }
    }

    // ------------------------------------------------------------------------
    // History and unit of work
    // ------------------------------------------------------------------------

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut MessageHistory {
        &mut self.history
    }

    pub fn unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    pub fn set_unit_of_work(&mut self, unit_of_work: Arc<UnitOfWork>) {
        self.unit_of_work = Some(unit_of_work);
    }

    pub fn detach_unit_of_work(&mut self) -> Option<Arc<UnitOfWork>> {
        self.unit_of_work.take()
    }

    // ------------------------------------------------------------------------
    // Copies
    // ------------------------------------------------------------------------

    /// Independent copy for a fan-out branch: fresh id, current message as the
    /// in message, no out message and no exception. Properties are copied
    /// except for control flags of the parent. The unit of work is shared.
    pub fn copy_for_branch(&self) -> Exchange {
        let mut properties = self.properties.clone();
        for name in CONTROL_PROPERTIES.iter().chain(FAILURE_PROPERTIES) {
            properties.remove(*name);
        }
        properties.insert(CORRELATION_ID.to_string(), Value::String(self.id.clone()));

        Exchange {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: self.pattern,
            in_message: self.message().clone(),
            out_message: None,
            properties,
            exception: None,
            caught_exception: None,
            history: self.history.clone(),
            unit_of_work: self.unit_of_work.clone(),
            created_at: Utc::now(),
        }
    }

    /// Adopt the outcome of another exchange (typically an aggregated branch
    /// result): messages, properties and failure. Identity and history stay.
    pub fn copy_results_from(&mut self, result: Exchange) {
        let failed = result.exception.is_some();
        self.in_message = result.in_message;
        self.out_message = result.out_message;
        for (name, value) in result.properties {
            let name_ref = name.as_str();
            if name_ref == CORRELATION_ID || CONTROL_PROPERTIES.contains(&name_ref) {
                continue;
            }
            if !failed && FAILURE_PROPERTIES.contains(&name_ref) {
                continue;
            }
            self.properties.insert(name, value);
        }
        self.exception = result.exception;
        if result.caught_exception.is_some() {
            self.caught_exception = result.caught_exception;
        }
    }
}
