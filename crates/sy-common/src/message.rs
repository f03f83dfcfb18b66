use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A business-level failure carried in the message rather than raised as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub reason: String,
}

/// A body plus headers. Bodies are JSON values so any structured payload can
/// flow through the engine without a type parameter on every processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl Message {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
            fault: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    pub fn body_str(&self) -> Option<&str> {
        self.body.as_str()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    pub fn set_fault(&mut self, reason: impl Into<String>) {
        self.fault = Some(Fault { reason: reason.into() });
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_headers_and_body() {
        let mut msg = Message::new("hello").with_header("priority", 5);
        assert_eq!(msg.body_str(), Some("hello"));
        assert_eq!(msg.header("priority"), Some(&json!(5)));

        msg.set_header("region", "eu");
        assert_eq!(msg.header_str("region"), Some("eu"));
        assert_eq!(msg.remove_header("priority"), Some(json!(5)));
        assert!(msg.header("priority").is_none());
    }

    #[test]
    fn test_fault_flag() {
        let mut msg = Message::new(json!({"order": 1}));
        assert!(!msg.is_fault());
        msg.set_fault("credit limit exceeded");
        assert!(msg.is_fault());
        assert_eq!(msg.fault.as_ref().map(|f| f.reason.as_str()), Some("credit limit exceeded"));
    }
}
