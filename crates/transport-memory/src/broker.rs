//! Broker state shared by every channel of a [`crate::MemoryTransport`].
//!
//! All methods are synchronous and run under the transport's state lock.

use crate::Error;

use std::collections::{HashMap, VecDeque};

use courier_transport::{
    ConsumeOptions, Delivery, ExchangeDeclaration, ExchangeKind, Message, Publish,
    QueueDeclaration,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Clone, Debug)]
struct Enqueued {
    exchange: String,
    routing_key: String,
    message: Message,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    entry: Enqueued,
    consumer_tag: String,
    channel: u64,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel: u64,
    exclusive: bool,
    no_ack: bool,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    const fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

#[derive(Debug)]
struct QueueState {
    declaration: QueueDeclaration,
    owner: Option<u64>,
    ready: VecDeque<Enqueued>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    unacked: HashMap<u64, Unacked>,
}

impl QueueState {
    fn new(declaration: QueueDeclaration, owner: Option<u64>) -> Self {
        Self {
            declaration,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            unacked: HashMap::new(),
        }
    }

    /// Round-robin pick of the next consumer with spare prefetch capacity.
    fn next_eligible(&mut self) -> Option<usize> {
        let len = self.consumers.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            if self.consumers[index].has_capacity() {
                self.cursor = index + 1;
                return Some(index);
            }
        }
        None
    }

    fn locked_for(&self, channel: u64) -> bool {
        self.owner.is_some_and(|owner| owner != channel)
    }
}

#[derive(Debug, Default)]
pub struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    deliveries: HashMap<u64, String>,
    next_delivery_tag: u64,
    next_consumer: u64,
    nack_budget: usize,
}

impl BrokerState {
    pub fn declare_exchange(&mut self, declaration: &ExchangeDeclaration) -> Result<(), Error> {
        match self.exchanges.get(&declaration.name) {
            Some(kind) if *kind != declaration.kind => Err(Error::PreconditionFailed(format!(
                "exchange '{}' already declared as {kind:?}",
                declaration.name
            ))),
            Some(_) => Ok(()),
            None => {
                debug!(exchange = %declaration.name, kind = ?declaration.kind, "exchange declared");
                self.exchanges
                    .insert(declaration.name.clone(), declaration.kind);
                Ok(())
            }
        }
    }

    pub fn declare_queue(
        &mut self,
        declaration: &QueueDeclaration,
        channel: u64,
    ) -> Result<String, Error> {
        let name = if declaration.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            declaration.name.clone()
        };

        if let Some(queue) = self.queues.get(&name) {
            if queue.locked_for(channel) {
                return Err(Error::ResourceLocked(format!(
                    "queue '{name}' is exclusive to another channel"
                )));
            }
            return Ok(name);
        }

        let mut declaration = declaration.clone();
        declaration.name.clone_from(&name);
        let owner = declaration.exclusive.then_some(channel);
        debug!(queue = %name, exclusive = declaration.exclusive, "queue declared");
        self.queues
            .insert(name.clone(), QueueState::new(declaration, owner));

        Ok(name)
    }

    pub fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        if !self.queues.contains_key(queue) {
            return Err(Error::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(Error::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }

        let exists = self.bindings.iter().any(|b| {
            b.exchange == exchange && b.routing_key == routing_key && b.queue == queue
        });
        if !exists {
            self.bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }

        Ok(())
    }

    pub fn purge_queue(&mut self, queue: &str) -> Result<usize, Error> {
        let state = self.queues.get_mut(queue).ok_or_else(|| Error::NotFound {
            kind: "queue",
            name: queue.to_string(),
        })?;
        let dropped = state.ready.len();
        state.ready.clear();
        Ok(dropped)
    }

    /// Arms the broker to refuse the next `count` confirmed publishes.
    pub const fn nack_next(&mut self, count: usize) {
        self.nack_budget += count;
    }

    pub const fn take_nack(&mut self) -> bool {
        if self.nack_budget > 0 {
            self.nack_budget -= 1;
            true
        } else {
            false
        }
    }

    /// Routes a publish to every matching queue, at most one copy per queue.
    pub fn route(&mut self, publish: &Publish) -> Result<usize, Error> {
        let keys: Vec<&str> = std::iter::once(publish.routing_key.as_str())
            .chain(publish.cc.iter().map(String::as_str))
            .collect();

        let mut targets: Vec<String> = Vec::new();
        if publish.exchange.is_empty() {
            for key in keys {
                if self.queues.contains_key(key) && !targets.iter().any(|t| t == key) {
                    targets.push(key.to_string());
                }
            }
        } else {
            let kind = *self
                .exchanges
                .get(&publish.exchange)
                .ok_or_else(|| Error::NotFound {
                    kind: "exchange",
                    name: publish.exchange.clone(),
                })?;
            for binding in &self.bindings {
                if binding.exchange != publish.exchange {
                    continue;
                }
                let matched = match kind {
                    ExchangeKind::Direct => keys.contains(&binding.routing_key.as_str()),
                    ExchangeKind::Fanout => true,
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
        }

        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.ready.push_back(Enqueued {
                    exchange: publish.exchange.clone(),
                    routing_key: publish.routing_key.clone(),
                    message: publish.message.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(target);
        }

        trace!(routing_key = %publish.routing_key, queues = targets.len(), "message routed");
        Ok(targets.len())
    }

    pub fn consume(
        &mut self,
        queue: &str,
        channel: u64,
        options: &ConsumeOptions,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> Result<String, Error> {
        let state = self.queues.get_mut(queue).ok_or_else(|| Error::NotFound {
            kind: "queue",
            name: queue.to_string(),
        })?;

        if state.locked_for(channel)
            || state.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !state.consumers.is_empty())
        {
            return Err(Error::ResourceLocked(format!(
                "queue '{queue}' has an exclusive consumer"
            )));
        }

        self.next_consumer += 1;
        let tag = format!("ctag-{}", self.next_consumer);
        state.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel,
            exclusive: options.exclusive,
            no_ack: options.no_ack,
            prefetch: options.prefetch,
            in_flight: 0,
            sender,
        });
        debug!(queue = %queue, consumer_tag = %tag, "consumer started");

        self.dispatch(queue);
        Ok(tag)
    }

    pub fn ack(&mut self, delivery_tag: u64) -> Result<(), Error> {
        let (queue, _) = self.settle(delivery_tag)?;
        self.dispatch(&queue);
        Ok(())
    }

    pub fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        let (queue, mut entry) = self.settle(delivery_tag)?;

        if requeue {
            entry.redelivered = true;
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_front(entry);
            }
        } else if let Some(recyclebin) = self
            .queues
            .get(&queue)
            .and_then(|state| state.declaration.dead_letter_queue.clone())
        {
            let state = self.queues.entry(recyclebin.clone()).or_insert_with(|| {
                QueueState::new(
                    QueueDeclaration {
                        name: recyclebin.clone(),
                        ..QueueDeclaration::default()
                    },
                    None,
                )
            });
            entry.redelivered = false;
            state.ready.push_back(entry);
            debug!(queue = %queue, recyclebin = %recyclebin, "delivery dead-lettered");
            self.dispatch(&recyclebin);
        }

        self.dispatch(&queue);
        Ok(())
    }

    fn settle(&mut self, delivery_tag: u64) -> Result<(String, Enqueued), Error> {
        let queue = self
            .deliveries
            .remove(&delivery_tag)
            .ok_or(Error::UnknownDeliveryTag(delivery_tag))?;
        let state = self
            .queues
            .get_mut(&queue)
            .ok_or(Error::UnknownDeliveryTag(delivery_tag))?;
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(Error::UnknownDeliveryTag(delivery_tag))?;
        if let Some(slot) = state
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Ok((queue, unacked.entry))
    }

    pub fn cancel(&mut self, consumer_tag: &str) -> Result<(), Error> {
        let queue = self
            .queues
            .iter()
            .find(|(_, state)| state.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::UnknownConsumer(consumer_tag.to_string()))?;

        let mut delete = false;
        if let Some(state) = self.queues.get_mut(&queue) {
            state.consumers.retain(|c| c.tag != consumer_tag);
            delete = state.declaration.auto_delete && state.consumers.is_empty();
        }
        debug!(queue = %queue, consumer_tag = %consumer_tag, "consumer cancelled");

        if delete {
            self.delete_queue(&queue);
        }
        Ok(())
    }

    /// Releases everything a closing channel held: its consumers, its
    /// unacknowledged deliveries (requeued in original order) and its
    /// exclusive queues.
    pub fn close_channel(&mut self, channel: u64) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        let mut doomed = Vec::new();

        for name in &names {
            let Some(state) = self.queues.get_mut(name) else {
                continue;
            };
            state.consumers.retain(|c| c.channel != channel);

            let mut tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.channel == channel)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(mut unacked) = state.unacked.remove(&tag) {
                    unacked.entry.redelivered = true;
                    state.ready.push_front(unacked.entry);
                }
                self.deliveries.remove(&tag);
            }

            if state.owner == Some(channel)
                || (state.declaration.auto_delete && state.consumers.is_empty())
            {
                doomed.push(name.clone());
            }
        }

        for name in &doomed {
            self.delete_queue(name);
        }
        for name in &names {
            self.dispatch(name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(state) = self.queues.remove(name) {
            for tag in state.unacked.keys() {
                self.deliveries.remove(tag);
            }
        }
        self.bindings.retain(|b| b.queue != name);
        debug!(queue = %name, "queue deleted");
    }

    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|state| state.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|state| state.consumers.len())
    }

    fn dispatch(&mut self, name: &str) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(index) = queue.next_eligible() else {
                break;
            };
            let Some(entry) = queue.ready.pop_front() else {
                break;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let slot = &mut queue.consumers[index];

            let delivery = Delivery {
                delivery_tag,
                consumer_tag: slot.tag.clone(),
                exchange: entry.exchange.clone(),
                routing_key: entry.routing_key.clone(),
                redelivered: entry.redelivered,
                message: entry.message.clone(),
            };

            if slot.sender.send(delivery).is_err() {
                // Receiver is gone; drop the consumer and retry with the next one.
                queue.consumers.remove(index);
                queue.ready.push_front(entry);
                continue;
            }

            if !slot.no_ack {
                slot.in_flight += 1;
                let unacked = Unacked {
                    entry,
                    consumer_tag: slot.tag.clone(),
                    channel: slot.channel,
                };
                queue.unacked.insert(delivery_tag, unacked);
                self.deliveries.insert(delivery_tag, name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    fn publish(exchange: &str, routing_key: &str, body: &'static str) -> Publish {
        Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            cc: Vec::new(),
            message: Message::new(body),
        }
    }

    fn declare(state: &mut BrokerState, queue: &str, key: &str) {
        state
            .declare_exchange(&ExchangeDeclaration {
                name: "ex".to_string(),
                kind: ExchangeKind::Direct,
                durable: false,
            })
            .unwrap();
        state
            .declare_queue(
                &QueueDeclaration {
                    name: queue.to_string(),
                    ..QueueDeclaration::default()
                },
                1,
            )
            .unwrap();
        state.bind_queue(queue, "ex", key).unwrap();
    }

    #[test]
    fn test_competing_consumers_round_robin() {
        let mut state = BrokerState::default();
        declare(&mut state, "q", "k");

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let options = ConsumeOptions {
            no_ack: true,
            ..ConsumeOptions::default()
        };
        state.consume("q", 1, &options, tx1).unwrap();
        state.consume("q", 2, &options, tx2).unwrap();

        for body in ["a", "b", "c", "d"] {
            state.route(&publish("ex", "k", body)).unwrap();
        }

        let first: Vec<_> = std::iter::from_fn(|| rx1.try_recv().ok())
            .map(|d| d.message.content)
            .collect();
        let second: Vec<_> = std::iter::from_fn(|| rx2.try_recv().ok())
            .map(|d| d.message.content)
            .collect();
        assert_eq!(first, vec!["a", "c"]);
        assert_eq!(second, vec!["b", "d"]);
    }

    #[test]
    fn test_prefetch_holds_back_until_ack() {
        let mut state = BrokerState::default();
        declare(&mut state, "q", "k");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = ConsumeOptions {
            prefetch: 1,
            ..ConsumeOptions::default()
        };
        state.consume("q", 1, &options, tx).unwrap();
        state.route(&publish("ex", "k", "one")).unwrap();
        state.route(&publish("ex", "k", "two")).unwrap();

        let first = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(state.ready_count("q"), Some(1));

        state.ack(first.delivery_tag).unwrap();
        assert_eq!(rx.try_recv().unwrap().message.content, "two");
    }

    #[test]
    fn test_nack_without_requeue_moves_to_recyclebin() {
        let mut state = BrokerState::default();
        state
            .declare_exchange(&ExchangeDeclaration {
                name: "ex".to_string(),
                kind: ExchangeKind::Direct,
                durable: false,
            })
            .unwrap();
        state
            .declare_queue(
                &QueueDeclaration {
                    name: "q".to_string(),
                    dead_letter_queue: Some("trash".to_string()),
                    ..QueueDeclaration::default()
                },
                1,
            )
            .unwrap();
        state.bind_queue("q", "ex", "k").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .consume("q", 1, &ConsumeOptions::default(), tx)
            .unwrap();
        state.route(&publish("ex", "k", "bad")).unwrap();

        let delivery = rx.try_recv().unwrap();
        state.nack(delivery.delivery_tag, false).unwrap();

        assert_eq!(state.ready_count("q"), Some(0));
        assert_eq!(state.ready_count("trash"), Some(1));
    }

    #[test]
    fn test_cc_delivers_one_copy_per_queue() {
        let mut state = BrokerState::default();
        declare(&mut state, "main", "k");
        declare(&mut state, "backup", "k-backup");
        state.bind_queue("main", "ex", "k-backup").unwrap();

        let mut message = publish("ex", "k", "x");
        message.cc.push("k-backup".to_string());
        assert_eq!(state.route(&message).unwrap(), 2);
        assert_eq!(state.ready_count("main"), Some(1));
        assert_eq!(state.ready_count("backup"), Some(1));
    }

    #[test]
    fn test_exclusive_queue_is_locked_for_other_channels() {
        let mut state = BrokerState::default();
        let declaration = QueueDeclaration {
            name: "responses".to_string(),
            exclusive: true,
            ..QueueDeclaration::default()
        };

        state.declare_queue(&declaration, 1).unwrap();
        assert!(matches!(
            state.declare_queue(&declaration, 2),
            Err(Error::ResourceLocked(_))
        ));

        state.close_channel(1);
        assert!(state.declare_queue(&declaration, 2).is_ok());
    }

    #[test]
    fn test_close_channel_requeues_unacked_in_order() {
        let mut state = BrokerState::default();
        declare(&mut state, "q", "k");

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .consume("q", 7, &ConsumeOptions::default(), tx)
            .unwrap();
        for body in ["1", "2", "3"] {
            state.route(&publish("ex", "k", body)).unwrap();
        }
        while rx.try_recv().is_ok() {}

        state.close_channel(7);

        let (tx, mut rx) = mpsc::unbounded_channel();
        state
            .consume("q", 8, &ConsumeOptions::default(), tx)
            .unwrap();
        let bodies: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| (d.message.content, d.redelivered))
            .collect();
        assert_eq!(
            bodies,
            vec![
                (Bytes::from_static(b"1"), true),
                (Bytes::from_static(b"2"), true),
                (Bytes::from_static(b"3"), true),
            ]
        );
    }
}
