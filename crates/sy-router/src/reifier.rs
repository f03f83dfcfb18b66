//! Turns a [`RouteDefinition`] into the processor tree that runs it.
//!
//! Every output is wrapped in a [`Traced`] history recorder and, unless the
//! route has no error handler, in the route's [`RedeliveryErrorHandler`].
//! Failover children, doTry blocks, exception clause sub-routes and
//! onCompletion sub-routes are built without the error handler: the node that
//! owns them decides what a failure means.
//!
//! All configuration errors surface here, before the route starts.

use std::collections::HashMap;
use std::sync::Arc;

use sy_idempotent::IdempotentRepository;
use tracing::debug;

use crate::aggregation::{AggregationStrategyRef, UseLatestAggregationStrategy};
use crate::aggregator::Aggregator;
use crate::choice::{Choice, Filter, WhenClause};
use crate::completion::OnCompletion;
use crate::dataformat::{Marshal, Unmarshal};
use crate::definition::{
    AggregateDefinition, BeanRef, FanOutDefinition, LoadBalanceDefinition, Node, OnCompletionDefinition,
    OnExceptionDefinition, ResequenceDefinition, RouteDefinition, TryDefinition,
};
use crate::endpoint::{EndpointRegistry, SendProcessor};
use crate::error::ConfigError;
use crate::errorhandler::{
    ErrorHandlerConfig, ErrorHandlerDefinition, ErrorHandlerKind, ExceptionPolicy, RedeliveryErrorHandler,
};
use crate::executor::ExecutorRegistry;
use crate::idempotent::IdempotentConsumer;
use crate::loadbalancer::{build_load_balancer, LoadBalancerPolicy};
use crate::multicast::{FanOut, Multicast};
use crate::pipeline::Pipeline;
use crate::processor::{
    ProcessorRef, RemoveHeader, RollbackProcessor, SetBody, SetHeader, SetProperty, StopProcessor, Traced,
    Transform,
};
use crate::recipient_list::{RecipientList, RoutingSlip};
use crate::registry::Registry;
use crate::resequencer::Resequencer;
use crate::service::ServiceRef;
use crate::signal::ShutdownSignal;
use crate::splitter::Splitter;
use crate::throttle::{Delayer, Throttler};
use crate::try_catch::{CatchClause, DoTry};
use crate::wiretap::WireTap;

type BuildResult<T> = std::result::Result<T, ConfigError>;

/// Engine collaborators the reifier resolves references against.
pub(crate) struct ReifyContext<'a> {
    pub endpoints: &'a Arc<EndpointRegistry>,
    pub registry: &'a Registry,
    pub executors: &'a ExecutorRegistry,
    pub signal: &'a ShutdownSignal,
    pub default_error_handler: &'a ErrorHandlerDefinition,
}

pub(crate) struct ReifiedRoute {
    pub processor: ProcessorRef,
    pub services: Vec<ServiceRef>,
    pub on_completions: Vec<Arc<OnCompletion>>,
}

pub(crate) fn reify(definition: &RouteDefinition, context: ReifyContext<'_>) -> BuildResult<ReifiedRoute> {
    let mut reifier = Reifier {
        route_id: Arc::from(definition.id.as_str()),
        context,
        error_handler: None,
        wrapping: false,
        services: Vec::new(),
        counters: HashMap::new(),
    };

    let error_handler = definition
        .error_handler
        .as_ref()
        .unwrap_or(reifier.context.default_error_handler)
        .clone();
    if error_handler.kind != ErrorHandlerKind::NoErrorHandler {
        let policies = definition
            .on_exceptions
            .iter()
            .map(|clause| reifier.exception_policy(clause))
            .collect::<BuildResult<Vec<_>>>()?;
        reifier.error_handler = Some(Arc::new(reifier.error_handler_config(&error_handler, policies)));
        reifier.wrapping = true;
    } else if !definition.on_exceptions.is_empty() {
        debug!(route_id = %definition.id, "Route has no error handler; onException clauses ignored");
    }

    let processor = reifier.pipeline(&definition.nodes)?;

    let on_completions = definition
        .on_completions
        .iter()
        .map(|clause| reifier.on_completion(clause))
        .collect::<BuildResult<Vec<_>>>()?;

    debug!(
        route_id = %definition.id,
        nodes = reifier.counters.values().sum::<usize>(),
        services = reifier.services.len(),
        "Route reified"
    );

    Ok(ReifiedRoute {
        processor,
        services: reifier.services,
        on_completions,
    })
}

struct Reifier<'a> {
    route_id: Arc<str>,
    context: ReifyContext<'a>,
    error_handler: Option<Arc<ErrorHandlerConfig>>,
    /// Whether outputs built now get the route's error handler.
    wrapping: bool,
    services: Vec<ServiceRef>,
    counters: HashMap<&'static str, usize>,
}

impl<'a> Reifier<'a> {
    fn route_id(&self) -> String {
        self.route_id.to_string()
    }

    fn next_node_id(&mut self, label: &'static str) -> String {
        let counter = self.counters.entry(label).or_insert(0);
        *counter += 1;
        format!("{}{}", label, counter)
    }

    /// Handler for outputs built in the current scope.
    fn scoped_error_handler(&self) -> Option<Arc<ErrorHandlerConfig>> {
        if self.wrapping {
            self.error_handler.clone()
        } else {
            None
        }
    }

    fn unwrapped<T>(&mut self, build: impl FnOnce(&mut Self) -> BuildResult<T>) -> BuildResult<T> {
        let previous = std::mem::replace(&mut self.wrapping, false);
        let result = build(self);
        self.wrapping = previous;
        result
    }

    fn wrap(&mut self, label: &'static str, inner: ProcessorRef) -> ProcessorRef {
        let node_id = self.next_node_id(label);
        let traced: ProcessorRef = Arc::new(Traced::new(self.route_id.clone(), node_id, label.to_string(), inner));
        match self.scoped_error_handler() {
            Some(config) => Arc::new(RedeliveryErrorHandler::new(traced, config)),
            None => traced,
        }
    }

    fn pipeline(&mut self, nodes: &[Node]) -> BuildResult<ProcessorRef> {
        let mut steps = nodes
            .iter()
            .map(|node| self.node(node))
            .collect::<BuildResult<Vec<_>>>()?;
        if steps.len() == 1 {
            if let Some(step) = steps.pop() {
                return Ok(step);
            }
        }
        Ok(Arc::new(Pipeline::new(steps)))
    }

    fn node(&mut self, node: &Node) -> BuildResult<ProcessorRef> {
        let endpoints = self.context.endpoints.clone();
        let inner: ProcessorRef = match node {
            Node::Process(processor) => processor.clone(),
            Node::To(uri) => Arc::new(SendProcessor::new(uri.clone(), endpoints)),
            Node::Pipeline(nodes) => self.pipeline(nodes)?,
            Node::Filter(def) => Arc::new(Filter::new(def.predicate.clone(), self.pipeline(&def.nodes)?)),
            Node::Choice(def) => {
                let mut whens = Vec::with_capacity(def.whens.len());
                for (predicate, nodes) in &def.whens {
                    whens.push(WhenClause {
                        predicate: predicate.clone(),
                        processor: self.pipeline(nodes)?,
                    });
                }
                let otherwise = def.otherwise.as_deref().map(|nodes| self.pipeline(nodes)).transpose()?;
                Arc::new(Choice::new(whens, otherwise))
            }
            Node::Multicast(def) => {
                if def.outputs.is_empty() {
                    return Err(ConfigError::NoOutputs("multicast".into()));
                }
                let processors = def
                    .outputs
                    .iter()
                    .map(|output| self.node(output))
                    .collect::<BuildResult<Vec<_>>>()?;
                let fan_out = self.fan_out(&def.fan_out, Some(Arc::new(UseLatestAggregationStrategy)))?;
                Arc::new(Multicast::new(processors, fan_out))
            }
            Node::RecipientList(def) => {
                let fan_out = self.fan_out(&def.fan_out, Some(Arc::new(UseLatestAggregationStrategy)))?;
                Arc::new(
                    RecipientList::new(def.expression.clone(), endpoints, self.scoped_error_handler(), fan_out)
                        .with_delimiter(def.delimiter.clone())
                        .with_ignore_invalid_endpoints(def.ignore_invalid_endpoints),
                )
            }
            Node::RoutingSlip(def) => Arc::new(
                RoutingSlip::new(def.expression.clone(), endpoints, self.scoped_error_handler())
                    .with_delimiter(def.delimiter.clone())
                    .with_ignore_invalid_endpoints(def.ignore_invalid_endpoints)
                    .with_dynamic(def.dynamic),
            ),
            Node::Split(def) => {
                let processor = self.pipeline(&def.nodes)?;
                let fan_out = self.fan_out(&def.fan_out, None)?;
                Arc::new(Splitter::new(def.expression.clone(), processor, fan_out).with_streaming(def.streaming))
            }
            Node::Aggregate(def) => self.aggregate(def)?,
            Node::Resequence(def) => self.resequence(def)?,
            Node::LoadBalance(def) => self.load_balance(def)?,
            Node::IdempotentConsumer(def) => {
                let repository = self.idempotent_repository(&def.repository)?;
                let processor = self.pipeline(&def.nodes)?;
                Arc::new(
                    IdempotentConsumer::new(def.expression.clone(), repository, processor)
                        .with_eager(def.eager)
                        .with_skip_duplicate(def.skip_duplicate)
                        .with_remove_on_failure(def.remove_on_failure),
                )
            }
            Node::DoTry(def) => self.unwrapped(|r| r.do_try(def))?,
            Node::Throttle(def) => Arc::new(
                Throttler::new(def.max_requests, def.period)?.with_reject_execution(def.reject_execution),
            ),
            Node::Delay(expression) => Arc::new(Delayer::new(expression.clone())),
            Node::WireTap(def) => {
                let pool = self.context.executors.lookup(def.executor_ref.as_deref())?;
                let target: ProcessorRef = Arc::new(SendProcessor::new(def.uri.clone(), endpoints));
                let mut tap = WireTap::new(target, pool);
                if let Some(body) = &def.body {
                    tap = tap.with_body(body.clone());
                }
                Arc::new(tap)
            }
            Node::SetBody(expression) => Arc::new(SetBody::new(expression.clone())),
            Node::Transform(expression) => Arc::new(Transform::new(expression.clone())),
            Node::SetHeader(name, expression) => Arc::new(SetHeader::new(name.clone(), expression.clone())),
            Node::SetProperty(name, expression) => Arc::new(SetProperty::new(name.clone(), expression.clone())),
            Node::RemoveHeader(name) => Arc::new(RemoveHeader::new(name.clone())),
            Node::Marshal(name) => Arc::new(Marshal::new(self.data_format(name)?)),
            Node::Unmarshal(name) => Arc::new(Unmarshal::new(self.data_format(name)?)),
            Node::Rollback(message) => Arc::new(RollbackProcessor::new(message.clone())),
            Node::Stop => Arc::new(StopProcessor),
        };
        Ok(self.wrap(node.label(), inner))
    }

    // ------------------------------------------------------------------------
    // Stateful nodes
    // ------------------------------------------------------------------------

    fn aggregate(&mut self, def: &AggregateDefinition) -> BuildResult<ProcessorRef> {
        let strategy = match &def.strategy {
            Some(bean) => self.aggregation_strategy(bean)?,
            None => Arc::new(UseLatestAggregationStrategy),
        };
        let output = self.pipeline(&def.nodes)?;

        let mut aggregator = Aggregator::new(self.route_id(), def.correlation.clone(), strategy, output)
            .with_ignore_invalid_correlation_keys(def.ignore_invalid_correlation_keys)
            .with_force_completion_on_stop(def.force_completion_on_stop);
        if let Some(size) = def.completion_size {
            aggregator = aggregator.with_completion_size(size);
        }
        if let Some(predicate) = &def.completion_predicate {
            aggregator = aggregator.with_completion_predicate(predicate.clone());
        }
        if let Some(timeout) = def.completion_timeout {
            aggregator = aggregator.with_completion_timeout(timeout);
        }
        if !aggregator.has_completion_condition() {
            return Err(ConfigError::MissingCompletionCondition(self.route_id()));
        }

        let aggregator = Arc::new(aggregator);
        self.services.push(aggregator.clone());
        Ok(aggregator)
    }

    fn resequence(&mut self, def: &ResequenceDefinition) -> BuildResult<ProcessorRef> {
        let output = self.pipeline(&def.nodes)?;
        let resequencer = Arc::new(
            Resequencer::new(self.route_id(), def.expression.clone(), output)
                .with_batch_size(def.batch_size)
                .with_batch_timeout(def.batch_timeout)
                .with_allow_duplicates(def.allow_duplicates)
                .with_duplicate_policy(def.duplicate_policy)
                .with_reverse(def.reverse)
                .with_ignore_invalid_exchanges(def.ignore_invalid_exchanges),
        );
        self.services.push(resequencer.clone());
        Ok(resequencer)
    }

    fn load_balance(&mut self, def: &LoadBalanceDefinition) -> BuildResult<ProcessorRef> {
        let policy = def.policy()?.clone();
        let processors = match policy {
            LoadBalancerPolicy::Failover(_) => self.unwrapped(|r| {
                def.outputs.iter().map(|output| r.node(output)).collect::<BuildResult<Vec<_>>>()
            })?,
            _ => def
                .outputs
                .iter()
                .map(|output| self.node(output))
                .collect::<BuildResult<Vec<_>>>()?,
        };

        let (processor, service) =
            build_load_balancer(&self.route_id, &policy, processors, self.context.signal.clone())?;
        self.services.push(service);
        Ok(processor)
    }

    fn do_try(&mut self, def: &TryDefinition) -> BuildResult<ProcessorRef> {
        if def.catches.is_empty() && def.finally.is_none() {
            return Err(ConfigError::TryWithoutCatchOrFinally);
        }
        let block = self.pipeline(&def.nodes)?;

        let mut catches = Vec::with_capacity(def.catches.len());
        for clause in &def.catches {
            if clause.kinds.is_empty() {
                return Err(ConfigError::CatchWithoutExceptions);
            }
            catches.push(CatchClause {
                kinds: clause.kinds.clone(),
                on_when: clause.on_when.clone(),
                processor: self.pipeline(&clause.nodes)?,
            });
        }
        let finally = def.finally.as_deref().map(|nodes| self.pipeline(nodes)).transpose()?;

        Ok(Arc::new(DoTry::new(block, catches, finally)))
    }

    // ------------------------------------------------------------------------
    // Route-level clauses
    // ------------------------------------------------------------------------

    fn exception_policy(&mut self, clause: &OnExceptionDefinition) -> BuildResult<ExceptionPolicy> {
        if clause.kinds.is_empty() {
            return Err(ConfigError::OnExceptionWithoutExceptions);
        }
        let processor = if clause.nodes.is_empty() {
            None
        } else {
            Some(self.unwrapped(|r| r.pipeline(&clause.nodes))?)
        };

        Ok(ExceptionPolicy {
            kinds: clause.kinds.clone(),
            on_when: clause.on_when.clone(),
            retry_while: clause.retry_while.clone(),
            redelivery: clause.redelivery.clone(),
            handled: clause.handled,
            continued: clause.continued,
            use_original_message: clause.use_original_message,
            processor,
            on_redelivery: clause.on_redelivery.clone(),
        })
    }

    fn error_handler_config(
        &self,
        definition: &ErrorHandlerDefinition,
        exception_policies: Vec<ExceptionPolicy>,
    ) -> ErrorHandlerConfig {
        let dead_letter_uri = match &definition.kind {
            ErrorHandlerKind::DeadLetterChannel(uri) => Some(uri.clone()),
            _ => None,
        };
        ErrorHandlerConfig {
            route_id: self.route_id(),
            dead_letter_uri,
            policy: definition.redelivery.clone(),
            exception_policies,
            use_original_message: definition.use_original_message,
            dead_letter_handle_new_exception: definition.dead_letter_handle_new_exception,
            on_redelivery: definition.on_redelivery.clone(),
            allow_redelivery_while_stopping: definition.allow_redelivery_while_stopping,
            handle_fault: definition.handle_fault,
            endpoints: self.context.endpoints.clone(),
            signal: self.context.signal.clone(),
        }
    }

    fn on_completion(&mut self, clause: &OnCompletionDefinition) -> BuildResult<Arc<OnCompletion>> {
        let processor = self.unwrapped(|r| r.pipeline(&clause.nodes))?;
        let mut on_completion = OnCompletion::new(self.route_id(), clause.mode, processor);
        if let Some(predicate) = &clause.on_when {
            on_completion = on_completion.with_on_when(predicate.clone());
        }
        if clause.parallel_processing {
            on_completion = on_completion.with_pool(self.context.executors.lookup(clause.executor_ref.as_deref())?);
        }
        Ok(Arc::new(on_completion))
    }

    // ------------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------------

    fn fan_out(&self, def: &FanOutDefinition, default: Option<AggregationStrategyRef>) -> BuildResult<FanOut> {
        let strategy = match &def.strategy {
            Some(bean) => Some(self.aggregation_strategy(bean)?),
            None => default,
        };
        let mut fan_out = FanOut::new(strategy).with_stop_on_exception(def.stop_on_exception);
        if def.parallel_processing {
            fan_out = fan_out.with_parallel(self.context.executors.lookup(def.executor_ref.as_deref())?);
        }
        Ok(fan_out)
    }

    fn aggregation_strategy(&self, bean: &BeanRef<AggregationStrategyRef>) -> BuildResult<AggregationStrategyRef> {
        match bean {
            BeanRef::Instance(strategy) => Ok(strategy.clone()),
            BeanRef::Named(name) => self.context.registry.lookup_aggregation_strategy(name),
        }
    }

    fn idempotent_repository(
        &self,
        bean: &BeanRef<Arc<dyn IdempotentRepository>>,
    ) -> BuildResult<Arc<dyn IdempotentRepository>> {
        match bean {
            BeanRef::Instance(repository) => Ok(repository.clone()),
            BeanRef::Named(name) => self.context.registry.lookup_idempotent_repository(name),
        }
    }

    fn data_format(&self, name: &str) -> BuildResult<crate::dataformat::DataFormatRef> {
        self.context
            .registry
            .resolve_data_format(name)
            .ok_or_else(|| ConfigError::registry_miss("DataFormat", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{CatchDefinition, OnExceptionDefinition, SplitDefinition};
    use crate::loadbalancer::FailoverConfig;
    use crate::processor::processor_fn;
    use crate::splitter::{ExpressionSplit, SplitExpressionRef};
    use std::time::Duration;
    use sy_common::expression::{body, header};
    use sy_common::Exchange;
    use sy_config::EngineConfig;

    struct Fixture {
        endpoints: Arc<EndpointRegistry>,
        registry: Registry,
        executors: ExecutorRegistry,
        signal: ShutdownSignal,
        error_handler: ErrorHandlerDefinition,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                endpoints: Arc::new(EndpointRegistry::new()),
                registry: Registry::new(),
                executors: ExecutorRegistry::from_config(&EngineConfig::default()),
                signal: ShutdownSignal::new(),
                error_handler: ErrorHandlerDefinition::default(),
            }
        }

        fn reify(&self, definition: &RouteDefinition) -> BuildResult<ReifiedRoute> {
            reify(
                definition,
                ReifyContext {
                    endpoints: &self.endpoints,
                    registry: &self.registry,
                    executors: &self.executors,
                    signal: &self.signal,
                    default_error_handler: &self.error_handler,
                },
            )
        }
    }

    fn split_body() -> SplitExpressionRef {
        Arc::new(ExpressionSplit::new(body()))
    }

    #[test]
    fn test_load_balancer_conflict_fails_build() {
        let fixture = Fixture::new();
        let definition = RouteDefinition::new("lb", "direct:lb").node(Node::LoadBalance(
            LoadBalanceDefinition::new()
                .failover(FailoverConfig::default())
                .round_robin()
                .to("mock:a")
                .to("mock:b"),
        ));

        let err = fixture.reify(&definition).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("roundRobin"));
        assert!(err.contains("failover"));
    }

    #[test]
    fn test_validation_errors() {
        let fixture = Fixture::new();

        let no_catch = RouteDefinition::new("t", "direct:t").node(Node::DoTry(TryDefinition::new(vec![Node::to("mock:a")])));
        assert!(matches!(fixture.reify(&no_catch), Err(ConfigError::TryWithoutCatchOrFinally)));

        let empty_catch = RouteDefinition::new("t", "direct:t").node(Node::DoTry(
            TryDefinition::new(vec![Node::to("mock:a")]).catch(CatchDefinition::new(Vec::<String>::new(), vec![])),
        ));
        assert!(matches!(fixture.reify(&empty_catch), Err(ConfigError::CatchWithoutExceptions)));

        let no_kinds = RouteDefinition::new("t", "direct:t").on_exception(OnExceptionDefinition::new(Vec::<String>::new()));
        assert!(matches!(fixture.reify(&no_kinds), Err(ConfigError::OnExceptionWithoutExceptions)));

        let aggregate = RouteDefinition::new("agg", "direct:agg").node(Node::Aggregate(AggregateDefinition::new(
            header("id"),
            vec![Node::to("mock:out")],
        )));
        assert!(matches!(fixture.reify(&aggregate), Err(ConfigError::MissingCompletionCondition(_))));

        let circuit = RouteDefinition::new("cb", "direct:cb").node(Node::LoadBalance(
            LoadBalanceDefinition::new()
                .circuit_breaker(Default::default())
                .to("mock:a")
                .to("mock:b"),
        ));
        assert!(matches!(fixture.reify(&circuit), Err(ConfigError::CircuitBreakerTargets(2))));

        let throttle = RouteDefinition::new("th", "direct:th").node(Node::Throttle(
            crate::definition::ThrottleDefinition::new(0, Duration::from_secs(1)),
        ));
        assert!(matches!(fixture.reify(&throttle), Err(ConfigError::InvalidThrottle(_))));
    }

    #[test]
    fn test_registry_misses_fail_build() {
        let fixture = Fixture::new();

        let marshal = RouteDefinition::new("m", "direct:m").node(Node::Marshal("csv".into()));
        assert!(matches!(fixture.reify(&marshal), Err(ConfigError::RegistryMiss { .. })));

        let split = RouteDefinition::new("s", "direct:s").node(Node::Split(
            SplitDefinition::new(split_body(), vec![Node::to("mock:a")])
                .with_fan_out(FanOutDefinition::default().with_strategy_ref("missing")),
        ));
        match fixture.reify(&split) {
            Err(ConfigError::RegistryMiss { kind, name }) => {
                assert_eq!(kind, "AggregationStrategy");
                assert_eq!(name, "missing");
            }
            _ => panic!("expected a registry miss"),
        }

        let pool = RouteDefinition::new("p", "direct:p").node(Node::Split(
            SplitDefinition::new(split_body(), vec![Node::to("mock:a")])
                .with_fan_out(FanOutDefinition::default().with_executor_ref("nope")),
        ));
        assert!(matches!(fixture.reify(&pool), Err(ConfigError::RegistryMiss { .. })));
    }

    #[tokio::test]
    async fn test_nodes_record_history_and_collect_services() {
        let fixture = Fixture::new();
        fixture.endpoints.register("mock:a", processor_fn(|_| Ok(())));

        let definition = RouteDefinition::new("hist", "direct:hist")
            .process(processor_fn(|ex| {
                ex.set_body("changed");
                Ok(())
            }))
            .to("mock:a")
            .node(Node::Resequence(ResequenceDefinition::new(body(), vec![Node::to("mock:a")])));
        let reified = fixture.reify(&definition).unwrap();
        assert_eq!(reified.services.len(), 1);

        let mut ex = Exchange::with_body("x");
        reified.processor.process(&mut ex).await.unwrap();
        assert_eq!(ex.history().node_ids(), vec!["process1", "to1", "resequence1"]);
    }

    #[tokio::test]
    async fn test_outputs_are_wrapped_by_route_error_handler() {
        let mut fixture = Fixture::new();
        fixture.error_handler = ErrorHandlerDefinition::dead_letter_channel("mock:dead")
            .maximum_redeliveries(2)
            .redelivery_delay(Duration::from_millis(1));
        let dead = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let dead = dead.clone();
            fixture.endpoints.register(
                "mock:dead",
                processor_fn(move |_| {
                    dead.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let failing = {
            let attempts = attempts.clone();
            processor_fn(move |_| {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(sy_common::ExchangeError::processing("IOException", "boom"))
            })
        };

        let definition = RouteDefinition::new("eh", "direct:eh").process(failing);
        let reified = fixture.reify(&definition).unwrap();

        let mut ex = Exchange::with_body("x");
        reified.processor.process(&mut ex).await.unwrap();
        assert!(!ex.is_failed());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(dead.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
