//! Well-known exchange property and message header names.
//!
//! Properties are engine bookkeeping attached to the exchange; the redelivery
//! names are also written as headers on the message so downstream endpoints
//! can see them.

// ============================================================================
// Routing
// ============================================================================

pub const CORRELATION_ID: &str = "SwitchyardCorrelationId";
pub const TO_ENDPOINT: &str = "SwitchyardToEndpoint";
pub const FROM_ENDPOINT: &str = "SwitchyardFromEndpoint";
pub const FROM_ROUTE_ID: &str = "SwitchyardFromRouteId";
pub const ROUTE_STOP: &str = "SwitchyardRouteStop";
pub const FILTER_MATCHED: &str = "SwitchyardFilterMatched";
pub const CHOICE_MATCHED: &str = "SwitchyardChoiceMatched";
pub const CHOICE_BRANCH: &str = "SwitchyardChoiceBranch";
pub const DUPLICATE_MESSAGE: &str = "SwitchyardDuplicateMessage";
pub const ON_COMPLETION: &str = "SwitchyardOnCompletion";

// ============================================================================
// Fan-out
// ============================================================================

pub const MULTICAST_INDEX: &str = "SwitchyardMulticastIndex";
pub const MULTICAST_COMPLETE: &str = "SwitchyardMulticastComplete";
pub const RECIPIENT_LIST_ENDPOINT: &str = "SwitchyardRecipientListEndpoint";
pub const SLIP_ENDPOINT: &str = "SwitchyardSlipEndpoint";
pub const SLIP_INDEX: &str = "SwitchyardSlipIndex";
pub const SPLIT_INDEX: &str = "SwitchyardSplitIndex";
pub const SPLIT_SIZE: &str = "SwitchyardSplitSize";
pub const SPLIT_COMPLETE: &str = "SwitchyardSplitComplete";

// ============================================================================
// Aggregation
// ============================================================================

pub const AGGREGATED_SIZE: &str = "SwitchyardAggregatedSize";
pub const AGGREGATED_COMPLETED_BY: &str = "SwitchyardAggregatedCompletedBy";
pub const AGGREGATED_CORRELATION_KEY: &str = "SwitchyardAggregatedCorrelationKey";

// ============================================================================
// Error handling
// ============================================================================

pub const EXCEPTION_CAUGHT: &str = "SwitchyardExceptionCaught";
pub const ERRORHANDLER_HANDLED: &str = "SwitchyardErrorHandlerHandled";
pub const FAILURE_HANDLED: &str = "SwitchyardFailureHandled";
pub const FAILURE_ENDPOINT: &str = "SwitchyardFailureEndpoint";
pub const FAILURE_ROUTE_ID: &str = "SwitchyardFailureRouteId";
pub const REDELIVERED: &str = "SwitchyardRedelivered";
pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
pub const REDELIVERY_MAX_COUNTER: &str = "SwitchyardRedeliveryMaxCounter";
pub const REDELIVERY_DELAY: &str = "SwitchyardRedeliveryDelay";
pub const REDELIVERY_EXHAUSTED: &str = "SwitchyardRedeliveryExhausted";

/// Properties that steer the exchange they are set on and must not leak into
/// a parent when branch results are merged back.
pub const CONTROL_PROPERTIES: &[&str] = &[ERRORHANDLER_HANDLED, ROUTE_STOP, FILTER_MATCHED];

/// Properties that only mean something while an exception is attached.
pub const FAILURE_PROPERTIES: &[&str] = &[REDELIVERY_EXHAUSTED, FAILURE_HANDLED];
