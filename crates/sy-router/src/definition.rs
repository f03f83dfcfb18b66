//! Route definitions: plain typed values describing what a route does.
//!
//! A [`RouteDefinition`] is a list of [`Node`]s plus route-level settings
//! (error handler, exception clauses, completion callbacks, lifecycle
//! policies). Definitions are turned into processors by the reifier when the
//! route is added to an engine; nothing here runs exchanges.

use std::sync::Arc;
use std::time::Duration;

use sy_common::{ExpressionRef, PredicateRef};
use sy_idempotent::IdempotentRepository;

use crate::aggregation::AggregationStrategyRef;
use crate::completion::OnCompletionMode;
use crate::error::ConfigError;
use crate::errorhandler::{ErrorHandlerDefinition, RedeliveryPolicy};
use crate::loadbalancer::{CircuitBreakerConfig, FailoverConfig, LoadBalancerPolicy};
use crate::processor::ProcessorRef;
use crate::resequencer::{DuplicatePolicy, DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT};
use crate::service::{ConsumerRef, ShutdownRoute, ShutdownRunningTask};
use crate::splitter::SplitExpressionRef;

/// A collaborator given either directly or by registry name.
#[derive(Clone)]
pub enum BeanRef<T> {
    Instance(T),
    Named(String),
}

impl<T> BeanRef<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

// ============================================================================
// Nodes
// ============================================================================

pub enum Node {
    Process(ProcessorRef),
    To(String),
    Pipeline(Vec<Node>),
    Filter(FilterDefinition),
    Choice(ChoiceDefinition),
    Multicast(MulticastDefinition),
    RecipientList(RecipientListDefinition),
    RoutingSlip(RoutingSlipDefinition),
    Split(SplitDefinition),
    Aggregate(AggregateDefinition),
    Resequence(ResequenceDefinition),
    LoadBalance(LoadBalanceDefinition),
    IdempotentConsumer(IdempotentConsumerDefinition),
    DoTry(TryDefinition),
    Throttle(ThrottleDefinition),
    Delay(ExpressionRef),
    WireTap(WireTapDefinition),
    SetBody(ExpressionRef),
    Transform(ExpressionRef),
    SetHeader(String, ExpressionRef),
    SetProperty(String, ExpressionRef),
    RemoveHeader(String),
    /// Data format name resolved through the registry.
    Marshal(String),
    Unmarshal(String),
    Rollback(String),
    Stop,
}

impl Node {
    pub fn to(uri: impl Into<String>) -> Self {
        Self::To(uri.into())
    }

    /// Label used for node ids and message history.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Process(_) => "process",
            Self::To(_) => "to",
            Self::Pipeline(_) => "pipeline",
            Self::Filter(_) => "filter",
            Self::Choice(_) => "choice",
            Self::Multicast(_) => "multicast",
            Self::RecipientList(_) => "recipientList",
            Self::RoutingSlip(_) => "routingSlip",
            Self::Split(_) => "split",
            Self::Aggregate(_) => "aggregate",
            Self::Resequence(_) => "resequence",
            Self::LoadBalance(_) => "loadBalance",
            Self::IdempotentConsumer(_) => "idempotentConsumer",
            Self::DoTry(_) => "doTry",
            Self::Throttle(_) => "throttle",
            Self::Delay(_) => "delay",
            Self::WireTap(_) => "wireTap",
            Self::SetBody(_) => "setBody",
            Self::Transform(_) => "transform",
            Self::SetHeader(..) => "setHeader",
            Self::SetProperty(..) => "setProperty",
            Self::RemoveHeader(_) => "removeHeader",
            Self::Marshal(_) => "marshal",
            Self::Unmarshal(_) => "unmarshal",
            Self::Rollback(_) => "rollback",
            Self::Stop => "stop",
        }
    }
}

pub struct FilterDefinition {
    pub predicate: PredicateRef,
    pub nodes: Vec<Node>,
}

impl FilterDefinition {
    pub fn new(predicate: PredicateRef, nodes: Vec<Node>) -> Self {
        Self { predicate, nodes }
    }
}

#[derive(Default)]
pub struct ChoiceDefinition {
    pub whens: Vec<(PredicateRef, Vec<Node>)>,
    pub otherwise: Option<Vec<Node>>,
}

impl ChoiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, predicate: PredicateRef, nodes: Vec<Node>) -> Self {
        self.whens.push((predicate, nodes));
        self
    }

    pub fn otherwise(mut self, nodes: Vec<Node>) -> Self {
        self.otherwise = Some(nodes);
        self
    }
}

/// Options shared by every fan-out node.
#[derive(Clone, Default)]
pub struct FanOutDefinition {
    pub strategy: Option<BeanRef<AggregationStrategyRef>>,
    pub parallel_processing: bool,
    /// Thread pool profile id; the default pool when unset.
    pub executor_ref: Option<String>,
    pub stop_on_exception: bool,
}

impl FanOutDefinition {
    pub fn with_strategy(mut self, strategy: AggregationStrategyRef) -> Self {
        self.strategy = Some(BeanRef::Instance(strategy));
        self
    }

    pub fn with_strategy_ref(mut self, name: impl Into<String>) -> Self {
        self.strategy = Some(BeanRef::named(name));
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel_processing = true;
        self
    }

    pub fn with_executor_ref(mut self, id: impl Into<String>) -> Self {
        self.parallel_processing = true;
        self.executor_ref = Some(id.into());
        self
    }

    pub fn stop_on_exception(mut self) -> Self {
        self.stop_on_exception = true;
        self
    }
}

pub struct MulticastDefinition {
    /// One branch per node.
    pub outputs: Vec<Node>,
    pub fan_out: FanOutDefinition,
}

impl MulticastDefinition {
    pub fn new(outputs: Vec<Node>) -> Self {
        Self {
            outputs,
            fan_out: FanOutDefinition::default(),
        }
    }

    pub fn with_fan_out(mut self, fan_out: FanOutDefinition) -> Self {
        self.fan_out = fan_out;
        self
    }
}

pub struct RecipientListDefinition {
    pub expression: ExpressionRef,
    pub delimiter: String,
    pub ignore_invalid_endpoints: bool,
    pub fan_out: FanOutDefinition,
}

impl RecipientListDefinition {
    pub fn new(expression: ExpressionRef) -> Self {
        Self {
            expression,
            delimiter: ",".into(),
            ignore_invalid_endpoints: false,
            fan_out: FanOutDefinition::default(),
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn ignore_invalid_endpoints(mut self) -> Self {
        self.ignore_invalid_endpoints = true;
        self
    }

    pub fn with_fan_out(mut self, fan_out: FanOutDefinition) -> Self {
        self.fan_out = fan_out;
        self
    }
}

pub struct RoutingSlipDefinition {
    pub expression: ExpressionRef,
    pub delimiter: String,
    pub ignore_invalid_endpoints: bool,
    /// Re-evaluate the expression whenever its destinations run out.
    pub dynamic: bool,
}

impl RoutingSlipDefinition {
    pub fn new(expression: ExpressionRef) -> Self {
        Self {
            expression,
            delimiter: ",".into(),
            ignore_invalid_endpoints: false,
            dynamic: false,
        }
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn ignore_invalid_endpoints(mut self) -> Self {
        self.ignore_invalid_endpoints = true;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }
}

pub struct SplitDefinition {
    pub expression: SplitExpressionRef,
    pub nodes: Vec<Node>,
    pub streaming: bool,
    /// Without a strategy the original message continues after the split.
    pub fan_out: FanOutDefinition,
}

impl SplitDefinition {
    pub fn new(expression: SplitExpressionRef, nodes: Vec<Node>) -> Self {
        Self {
            expression,
            nodes,
            streaming: false,
            fan_out: FanOutDefinition::default(),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_fan_out(mut self, fan_out: FanOutDefinition) -> Self {
        self.fan_out = fan_out;
        self
    }
}

pub struct AggregateDefinition {
    pub correlation: ExpressionRef,
    /// Defaults to keeping the latest exchange.
    pub strategy: Option<BeanRef<AggregationStrategyRef>>,
    pub completion_size: Option<usize>,
    pub completion_predicate: Option<PredicateRef>,
    pub completion_timeout: Option<Duration>,
    pub ignore_invalid_correlation_keys: bool,
    pub force_completion_on_stop: bool,
    pub nodes: Vec<Node>,
}

impl AggregateDefinition {
    pub fn new(correlation: ExpressionRef, nodes: Vec<Node>) -> Self {
        Self {
            correlation,
            strategy: None,
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            ignore_invalid_correlation_keys: false,
            force_completion_on_stop: false,
            nodes,
        }
    }

    pub fn with_strategy(mut self, strategy: AggregationStrategyRef) -> Self {
        self.strategy = Some(BeanRef::Instance(strategy));
        self
    }

    pub fn with_strategy_ref(mut self, name: impl Into<String>) -> Self {
        self.strategy = Some(BeanRef::named(name));
        self
    }

    pub fn completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size);
        self
    }

    pub fn completion_predicate(mut self, predicate: PredicateRef) -> Self {
        self.completion_predicate = Some(predicate);
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    pub fn ignore_invalid_correlation_keys(mut self) -> Self {
        self.ignore_invalid_correlation_keys = true;
        self
    }

    pub fn force_completion_on_stop(mut self) -> Self {
        self.force_completion_on_stop = true;
        self
    }
}

pub struct ResequenceDefinition {
    pub expression: ExpressionRef,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub allow_duplicates: bool,
    pub duplicate_policy: DuplicatePolicy,
    pub reverse: bool,
    pub ignore_invalid_exchanges: bool,
    pub nodes: Vec<Node>,
}

impl ResequenceDefinition {
    pub fn new(expression: ExpressionRef, nodes: Vec<Node>) -> Self {
        Self {
            expression,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            allow_duplicates: false,
            duplicate_policy: DuplicatePolicy::KeepFirst,
            reverse: false,
            ignore_invalid_exchanges: false,
            nodes,
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn allow_duplicates(mut self) -> Self {
        self.allow_duplicates = true;
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn ignore_invalid_exchanges(mut self) -> Self {
        self.ignore_invalid_exchanges = true;
        self
    }
}

/// A load-balance node. Exactly one policy may be chosen; choosing a second
/// is remembered and reported when the route is built.
#[derive(Default)]
pub struct LoadBalanceDefinition {
    policy: Option<LoadBalancerPolicy>,
    conflict: Option<ConfigError>,
    pub outputs: Vec<Node>,
}

impl LoadBalanceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_policy(mut self, policy: LoadBalancerPolicy) -> Self {
        match &self.policy {
            Some(existing) => {
                if self.conflict.is_none() {
                    self.conflict = Some(ConfigError::LoadBalancerConflict {
                        existing: existing.name().to_string(),
                        conflicting: policy.name().to_string(),
                    });
                }
            }
            None => self.policy = Some(policy),
        }
        self
    }

    pub fn round_robin(self) -> Self {
        self.with_policy(LoadBalancerPolicy::RoundRobin)
    }

    pub fn random(self) -> Self {
        self.with_policy(LoadBalancerPolicy::Random)
    }

    pub fn sticky(self, correlation: ExpressionRef) -> Self {
        self.with_policy(LoadBalancerPolicy::Sticky(correlation))
    }

    pub fn failover(self, config: FailoverConfig) -> Self {
        self.with_policy(LoadBalancerPolicy::Failover(config))
    }

    pub fn circuit_breaker(self, config: CircuitBreakerConfig) -> Self {
        self.with_policy(LoadBalancerPolicy::CircuitBreaker(config))
    }

    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.outputs.push(Node::To(uri.into()));
        self
    }

    pub fn output(mut self, node: Node) -> Self {
        self.outputs.push(node);
        self
    }

    /// The single configured policy, or the error recorded while configuring.
    pub fn policy(&self) -> Result<&LoadBalancerPolicy, ConfigError> {
        if let Some(conflict) = &self.conflict {
            return Err(conflict.clone());
        }
        self.policy.as_ref().ok_or(ConfigError::MissingLoadBalancerPolicy)
    }
}

pub struct IdempotentConsumerDefinition {
    pub expression: ExpressionRef,
    pub repository: BeanRef<Arc<dyn IdempotentRepository>>,
    pub eager: bool,
    pub skip_duplicate: bool,
    pub remove_on_failure: bool,
    pub nodes: Vec<Node>,
}

impl IdempotentConsumerDefinition {
    pub fn new(expression: ExpressionRef, repository: BeanRef<Arc<dyn IdempotentRepository>>, nodes: Vec<Node>) -> Self {
        Self {
            expression,
            repository,
            eager: true,
            skip_duplicate: true,
            remove_on_failure: true,
            nodes,
        }
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn skip_duplicate(mut self, skip: bool) -> Self {
        self.skip_duplicate = skip;
        self
    }

    pub fn remove_on_failure(mut self, remove: bool) -> Self {
        self.remove_on_failure = remove;
        self
    }
}

pub struct CatchDefinition {
    pub kinds: Vec<String>,
    pub on_when: Option<PredicateRef>,
    pub nodes: Vec<Node>,
}

impl CatchDefinition {
    pub fn new<I, S>(kinds: I, nodes: Vec<Node>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            on_when: None,
            nodes,
        }
    }

    pub fn on_when(mut self, predicate: PredicateRef) -> Self {
        self.on_when = Some(predicate);
        self
    }
}

pub struct TryDefinition {
    pub nodes: Vec<Node>,
    pub catches: Vec<CatchDefinition>,
    pub finally: Option<Vec<Node>>,
}

impl TryDefinition {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            catches: Vec::new(),
            finally: None,
        }
    }

    pub fn catch(mut self, clause: CatchDefinition) -> Self {
        self.catches.push(clause);
        self
    }

    pub fn finally(mut self, nodes: Vec<Node>) -> Self {
        self.finally = Some(nodes);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleDefinition {
    pub max_requests: u32,
    pub period: Duration,
    pub reject_execution: bool,
}

impl ThrottleDefinition {
    pub fn new(max_requests: u32, period: Duration) -> Self {
        Self {
            max_requests,
            period,
            reject_execution: false,
        }
    }

    pub fn reject_execution(mut self) -> Self {
        self.reject_execution = true;
        self
    }
}

pub struct WireTapDefinition {
    pub uri: String,
    pub body: Option<ExpressionRef>,
    pub executor_ref: Option<String>,
}

impl WireTapDefinition {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            body: None,
            executor_ref: None,
        }
    }

    pub fn with_body(mut self, body: ExpressionRef) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_executor_ref(mut self, id: impl Into<String>) -> Self {
        self.executor_ref = Some(id.into());
        self
    }
}

// ============================================================================
// Route-level clauses
// ============================================================================

/// `onException`: what to do with failures of the listed kinds.
pub struct OnExceptionDefinition {
    pub kinds: Vec<String>,
    pub on_when: Option<PredicateRef>,
    pub retry_while: Option<PredicateRef>,
    pub redelivery: Option<RedeliveryPolicy>,
    pub handled: Option<bool>,
    pub continued: bool,
    pub use_original_message: Option<bool>,
    pub on_redelivery: Option<ProcessorRef>,
    pub nodes: Vec<Node>,
}

impl OnExceptionDefinition {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            on_when: None,
            retry_while: None,
            redelivery: None,
            handled: None,
            continued: false,
            use_original_message: None,
            on_redelivery: None,
            nodes: Vec::new(),
        }
    }

    pub fn on_when(mut self, predicate: PredicateRef) -> Self {
        self.on_when = Some(predicate);
        self
    }

    pub fn retry_while(mut self, predicate: PredicateRef) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    pub fn redelivery_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    pub fn maximum_redeliveries(mut self, maximum: i32) -> Self {
        let policy = self.redelivery.take().unwrap_or_default();
        self.redelivery = Some(policy.maximum_redeliveries(maximum));
        self
    }

    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = Some(handled);
        self
    }

    pub fn continued(mut self, continued: bool) -> Self {
        self.continued = continued;
        self
    }

    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = Some(true);
        self
    }

    pub fn on_redelivery(mut self, processor: ProcessorRef) -> Self {
        self.on_redelivery = Some(processor);
        self
    }

    pub fn to(mut self, uri: impl Into<String>) -> Self {
        self.nodes.push(Node::To(uri.into()));
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }
}

pub struct OnCompletionDefinition {
    pub mode: OnCompletionMode,
    pub on_when: Option<PredicateRef>,
    /// Run on a pool instead of the completing task.
    pub parallel_processing: bool,
    pub executor_ref: Option<String>,
    pub nodes: Vec<Node>,
}

impl OnCompletionDefinition {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            mode: OnCompletionMode::Always,
            on_when: None,
            parallel_processing: false,
            executor_ref: None,
            nodes,
        }
    }

    pub fn on_complete_only(mut self) -> Self {
        self.mode = OnCompletionMode::CompleteOnly;
        self
    }

    pub fn on_failure_only(mut self) -> Self {
        self.mode = OnCompletionMode::FailureOnly;
        self
    }

    pub fn on_when(mut self, predicate: PredicateRef) -> Self {
        self.on_when = Some(predicate);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel_processing = true;
        self
    }

    pub fn with_executor_ref(mut self, id: impl Into<String>) -> Self {
        self.parallel_processing = true;
        self.executor_ref = Some(id.into());
        self
    }
}

// ============================================================================
// Routes
// ============================================================================

pub struct RouteDefinition {
    pub id: String,
    pub from: String,
    pub nodes: Vec<Node>,
    /// The engine's default handler when unset.
    pub error_handler: Option<ErrorHandlerDefinition>,
    pub on_exceptions: Vec<OnExceptionDefinition>,
    pub on_completions: Vec<OnCompletionDefinition>,
    pub startup_order: Option<u32>,
    pub shutdown_route: ShutdownRoute,
    pub shutdown_running_task: ShutdownRunningTask,
    pub consumer: Option<ConsumerRef>,
    pub auto_startup: bool,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            nodes: Vec::new(),
            error_handler: None,
            on_exceptions: Vec::new(),
            on_completions: Vec::new(),
            startup_order: None,
            shutdown_route: ShutdownRoute::Default,
            shutdown_running_task: ShutdownRunningTask::CompleteCurrentTaskOnly,
            consumer: None,
            auto_startup: true,
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn to(self, uri: impl Into<String>) -> Self {
        self.node(Node::To(uri.into()))
    }

    pub fn process(self, processor: ProcessorRef) -> Self {
        self.node(Node::Process(processor))
    }

    pub fn with_error_handler(mut self, error_handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    pub fn on_exception(mut self, clause: OnExceptionDefinition) -> Self {
        self.on_exceptions.push(clause);
        self
    }

    pub fn on_completion(mut self, clause: OnCompletionDefinition) -> Self {
        self.on_completions.push(clause);
        self
    }

    pub fn with_startup_order(mut self, order: u32) -> Self {
        self.startup_order = Some(order);
        self
    }

    pub fn with_shutdown_route(mut self, policy: ShutdownRoute) -> Self {
        self.shutdown_route = policy;
        self
    }

    pub fn with_shutdown_running_task(mut self, policy: ShutdownRunningTask) -> Self {
        self.shutdown_running_task = policy;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerRef) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_load_balancer_policy_is_a_conflict() {
        let definition = LoadBalanceDefinition::new()
            .failover(FailoverConfig::default())
            .round_robin()
            .to("mock:a");

        match definition.policy() {
            Err(ConfigError::LoadBalancerConflict { existing, conflicting }) => {
                assert_eq!(existing, "failover");
                assert_eq!(conflicting, "roundRobin");
            }
            _ => panic!("expected a load balancer conflict"),
        }
    }

    #[test]
    fn test_missing_policy() {
        let definition = LoadBalanceDefinition::new().to("mock:a");
        assert!(matches!(definition.policy(), Err(ConfigError::MissingLoadBalancerPolicy)));
    }

    #[test]
    fn test_node_labels() {
        assert_eq!(Node::to("mock:a").label(), "to");
        assert_eq!(Node::Stop.label(), "stop");
    }
}
