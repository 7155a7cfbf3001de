use rumqttc::QoS;
use std::collections::VecDeque;

use super::BrokerError;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Messages held back while the client is not connected.
#[derive(Debug)]
pub struct OutboundQueue {
    cap: usize,
    items: VecDeque<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new(cap: usize) -> Self {
        return OutboundQueue { cap, items: VecDeque::new() };
    }

    pub fn push(&mut self, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.items.len() >= self.cap {
            return Err(BrokerError::BackpressureExceeded(self.cap));
        }
        self.items.push_back(message);
        Ok(())
    }

    /// Puts a message that failed to send back at the head.
    pub fn requeue(&mut self, message: OutboundMessage) {
        self.items.push_front(message);
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
