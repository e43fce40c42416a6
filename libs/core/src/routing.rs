use std::sync::Arc;

use tracing::debug;

use crate::envelope::Offset;
use crate::errors::BridgeResult;
use crate::headers::MessageHeaders;
use crate::producer::Producer;

type RoutePredicate<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

struct OutboundRoute<M: Send + Sync + 'static> {
    predicate: RoutePredicate<M>,
    producer: Arc<Producer<M>>,
}

/// Where one routed message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub endpoint: String,
    pub offset: Option<Offset>,
}

/// Fans a message out to every producer whose predicate accepts it.
pub struct OutboundRouter<M: Send + Sync + 'static> {
    routes: Vec<OutboundRoute<M>>,
}

impl<M: Send + Sync + 'static> Default for OutboundRouter<M> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<M> OutboundRouter<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(mut self, predicate: F, producer: Arc<Producer<M>>) -> Self
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.routes.push(OutboundRoute {
            predicate: Box::new(predicate),
            producer,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Produces `message` on every matching route, in registration order.
    /// Stops at the first failing producer.
    pub async fn publish(&self, message: M, headers: MessageHeaders) -> BridgeResult<Vec<RouteOutcome>> {
        let mut outcomes = Vec::new();
        for route in self.routes.iter().filter(|route| (route.predicate)(&message)) {
            let offset = route
                .producer
                .produce_async(message.clone(), headers.clone())
                .await?;
            outcomes.push(RouteOutcome {
                endpoint: route.producer.endpoint().name.clone(),
                offset,
            });
        }
        if outcomes.is_empty() {
            debug!("no outbound route matched the message");
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::endpoint::ProducerEndpoint;
    use crate::testkit::InMemoryBroker;

    fn producer(broker: &Arc<InMemoryBroker>, name: &str) -> Arc<Producer<u32>> {
        Arc::new(
            Producer::new(
                ProducerEndpoint::new(name),
                Arc::new(JsonCodec::<u32>::new()),
                broker.clone(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn messages_reach_every_matching_route() {
        let broker = Arc::new(InMemoryBroker::new());
        let router = OutboundRouter::new()
            .route(|n: &u32| n % 2 == 0, producer(&broker, "even"))
            .route(|_: &u32| true, producer(&broker, "all"));

        for n in 0..5u32 {
            router.publish(n, MessageHeaders::new()).await.unwrap();
        }
        assert_eq!(broker.published("even").len(), 3);
        assert_eq!(broker.published("all").len(), 5);
    }

    #[tokio::test]
    async fn unmatched_message_goes_nowhere() {
        let broker = Arc::new(InMemoryBroker::new());
        let router = OutboundRouter::new().route(|n: &u32| *n > 100, producer(&broker, "big"));
        let outcomes = router.publish(1, MessageHeaders::new()).await.unwrap();
        assert!(outcomes.is_empty());
        assert!(broker.published("big").is_empty());
    }
}
