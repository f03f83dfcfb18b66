//! Switchyard Routing Engine
//!
//! This crate provides the mediation engine built on the `sy-common` exchange model:
//! - Processor: the uniform capability every node implements, plus Pipeline, Choice and Filter
//! - Fan-out patterns: Multicast, RecipientList, RoutingSlip and Splitter with pluggable aggregation
//! - Stateful patterns: Aggregator, Resequencer, IdempotentConsumer, Throttler
//! - Load balancers: round robin, random, sticky, failover and circuit breaker
//! - RedeliveryErrorHandler: redelivery policies, exception clauses and dead letter channels
//! - Route definitions, the reifier that builds them, and the EngineContext that runs them
//! - ShutdownStrategy: ordered, timeout-bounded graceful shutdown of routes

pub mod aggregation;
pub mod aggregator;
pub mod choice;
pub mod completion;
pub mod context;
pub mod dataformat;
pub mod definition;
pub mod endpoint;
pub mod error;
pub mod errorhandler;
pub mod executor;
pub mod idempotent;
pub mod loadbalancer;
pub mod multicast;
pub mod pipeline;
pub mod processor;
pub mod recipient_list;
pub mod registry;
pub mod resequencer;
pub mod route;
pub mod service;
pub mod shutdown;
pub mod signal;
pub mod splitter;
pub mod throttle;
pub mod try_catch;
pub mod wiretap;

mod reifier;

pub use aggregation::{
    aggregation_fn, AggregationStrategy, AggregationStrategyRef, GroupedBodyAggregationStrategy,
    UseLatestAggregationStrategy,
};
pub use completion::OnCompletionMode;
pub use context::EngineContext;
pub use dataformat::{DataFormat, DataFormatFactory, JsonDataFormat};
pub use definition::{
    AggregateDefinition, BeanRef, CatchDefinition, ChoiceDefinition, FanOutDefinition, FilterDefinition,
    IdempotentConsumerDefinition, LoadBalanceDefinition, MulticastDefinition, Node, OnCompletionDefinition,
    OnExceptionDefinition, RecipientListDefinition, ResequenceDefinition, RouteDefinition, RoutingSlipDefinition,
    SplitDefinition, ThrottleDefinition, TryDefinition, WireTapDefinition,
};
pub use endpoint::{EndpointRegistry, ProducerTemplate};
pub use error::{ConfigError, RouterError};
pub use errorhandler::{DelayPattern, ErrorHandlerDefinition, RedeliveryPolicy};
pub use executor::{ExecutorRegistry, Submission, ThreadPool};
pub use loadbalancer::{CircuitBreakerConfig, CircuitState, FailoverConfig};
pub use processor::{processor_fn, Processor, ProcessorRef};
pub use registry::Registry;
pub use resequencer::DuplicatePolicy;
pub use route::RouteStatus;
pub use service::{
    Consumer, ConsumerContext, ConsumerRef, ExceptionHandler, Service, ShutdownRoute, ShutdownRunningTask,
};
pub use shutdown::{ShutdownReport, ShutdownStrategy};
pub use signal::ShutdownSignal;
pub use splitter::{split_fn, ExpressionSplit, SplitExpression, Tokenizer};

pub type Result<T> = std::result::Result<T, RouterError>;
