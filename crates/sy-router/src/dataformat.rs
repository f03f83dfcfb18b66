//! Data formats and the marshal / unmarshal processors that apply them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sy_common::{Exchange, ExchangeError, Result};

use crate::processor::Processor;

/// Converts message bodies to and from a wire representation.
pub trait DataFormat: Send + Sync {
    fn marshal(&self, body: &Value) -> Result<Value>;

    fn unmarshal(&self, body: &Value) -> Result<Value>;
}

pub type DataFormatRef = Arc<dyn DataFormat>;

/// Creates a fresh data format instance per lookup.
pub trait DataFormatFactory: Send + Sync {
    fn create(&self) -> DataFormatRef;
}

pub type DataFormatFactoryRef = Arc<dyn DataFormatFactory>;

/// JSON text on the wire, structured values in the exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDataFormat {
    pub pretty: bool,
}

impl DataFormat for JsonDataFormat {
    fn marshal(&self, body: &Value) -> Result<Value> {
        let text = if self.pretty {
            serde_json::to_string_pretty(body)
        } else {
            serde_json::to_string(body)
        };
        text.map(Value::String)
            .map_err(|e| ExchangeError::processing("MarshalException", e.to_string()))
    }

    fn unmarshal(&self, body: &Value) -> Result<Value> {
        match body {
            Value::String(text) => serde_json::from_str(text)
                .map_err(|e| ExchangeError::processing("UnmarshalException", e.to_string())),
            other => Ok(other.clone()),
        }
    }
}

impl DataFormatFactory for JsonDataFormat {
    fn create(&self) -> DataFormatRef {
        Arc::new(*self)
    }
}

pub struct Marshal {
    format: DataFormatRef,
}

impl Marshal {
    pub fn new(format: DataFormatRef) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Processor for Marshal {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let body = self.format.marshal(exchange.body())?;
        exchange.set_body(body);
        Ok(())
    }
}

pub struct Unmarshal {
    format: DataFormatRef,
}

impl Unmarshal {
    pub fn new(format: DataFormatRef) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Processor for Unmarshal {
    async fn process(&self, exchange: &mut Exchange) -> Result<()> {
        let body = self.format.unmarshal(exchange.body())?;
        exchange.set_body(body);
        Ok(())
    }
}
