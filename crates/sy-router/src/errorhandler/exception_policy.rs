use sy_common::{Exchange, ExchangeError, PredicateRef};
use tracing::warn;

use crate::errorhandler::redelivery::RedeliveryPolicy;
use crate::processor::ProcessorRef;

/// A reified `onException` clause.
pub struct ExceptionPolicy {
    pub kinds: Vec<String>,
    pub on_when: Option<PredicateRef>,
    pub retry_while: Option<PredicateRef>,
    pub redelivery: Option<RedeliveryPolicy>,
    /// `None` defers to the handler (dead letter channels handle by default).
    pub handled: Option<bool>,
    pub continued: bool,
    pub use_original_message: Option<bool>,
    pub processor: Option<ProcessorRef>,
    pub on_redelivery: Option<ProcessorRef>,
}

impl ExceptionPolicy {
    fn matches_kind(&self, error: &ExchangeError, exact: bool) -> bool {
        self.kinds.iter().any(|kind| {
            if exact {
                kind != "*" && error.matches_kind(kind)
            } else {
                kind == "*"
            }
        })
    }

    fn matches_when(&self, exchange: &Exchange) -> bool {
        match &self.on_when {
            None => true,
            Some(predicate) => match predicate.matches(exchange) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(exchange_id = %exchange.id(), error = %e, "onWhen predicate failed; clause skipped");
                    false
                }
            },
        }
    }

    /// Pick the clause for a failure: clauses naming the kind (anywhere in the
    /// cause chain) win over wildcard clauses; declaration order breaks ties.
    pub fn select<'a>(
        policies: &'a [ExceptionPolicy],
        error: &ExchangeError,
        exchange: &Exchange,
    ) -> Option<&'a ExceptionPolicy> {
        policies
            .iter()
            .find(|p| p.matches_kind(error, true) && p.matches_when(exchange))
            .or_else(|| {
                policies
                    .iter()
                    .find(|p| p.matches_kind(error, false) && p.matches_when(exchange))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sy_common::expression::header_equals;
    use sy_common::Message;

    fn policy(kinds: &[&str]) -> ExceptionPolicy {
        ExceptionPolicy {
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            on_when: None,
            retry_while: None,
            redelivery: None,
            handled: None,
            continued: false,
            use_original_message: None,
            processor: None,
            on_redelivery: None,
        }
    }

    #[test]
    fn test_exact_kind_beats_wildcard() {
        let policies = vec![policy(&["*"]), policy(&["IOException"])];
        let ex = Exchange::with_body("x");
        let err = ExchangeError::processing("IOException", "disk");

        let selected = ExceptionPolicy::select(&policies, &err, &ex).unwrap();
        assert_eq!(selected.kinds, vec!["IOException".to_string()]);

        let other = ExchangeError::processing("ParseException", "bad");
        let selected = ExceptionPolicy::select(&policies, &other, &ex).unwrap();
        assert_eq!(selected.kinds, vec!["*".to_string()]);
    }

    #[test]
    fn test_on_when_filters() {
        let mut guarded = policy(&["IOException"]);
        guarded.on_when = Some(header_equals("retryable", true));
        let policies = vec![guarded];
        let err = ExchangeError::processing("IOException", "disk");

        let plain = Exchange::with_body("x");
        assert!(ExceptionPolicy::select(&policies, &err, &plain).is_none());

        let flagged = Exchange::new(Message::new("x").with_header("retryable", true));
        assert!(ExceptionPolicy::select(&policies, &err, &flagged).is_some());
    }
}
