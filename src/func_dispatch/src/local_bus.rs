// ========== Local Bus ==========

use async_trait::async_trait;
use func_lib::{BusMessage, BusReply, FnError, FnResult};
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::MessageBus;

const SUBSCRIPTION_QUEUE_SIZE: usize = 64;

/// One inbound request. Dropping it without `respond` fails the caller.
pub struct BusRequest {
    pub message: BusMessage,
    reply_tx: oneshot::Sender<BusReply>,
}

impl BusRequest {
    /// Returns false if the caller already stopped waiting.
    pub fn respond(self, reply: BusReply) -> bool {
        self.reply_tx.send(reply).is_ok()
    }
}

pub struct BusSubscription {
    subject: String,
    receiver: mpsc::Receiver<BusRequest>,
}

impl BusSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn next(&mut self) -> Option<BusRequest> {
        self.receiver.recv().await
    }
}

/// In-process subject registry with request/reply semantics. One subscriber
/// per subject; a later `subscribe` replaces the earlier one.
#[derive(Default)]
pub struct LocalBus {
    subjects: Mutex<HashMap<String, mpsc::Sender<BusRequest>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subject: &str) -> FnResult<BusSubscription> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_QUEUE_SIZE);
        let mut subjects = self
            .subjects
            .lock()
            .map_err(|e| FnError::Internal(format!("bus lock poisoned: {}", e)))?;
        if subjects.insert(subject.to_string(), sender).is_some() {
            debug!("subscriber of {} replaced", subject);
        }
        Ok(BusSubscription {
            subject: subject.to_string(),
            receiver,
        })
    }

    pub fn unsubscribe(&self, subject: &str) -> FnResult<()> {
        let mut subjects = self
            .subjects
            .lock()
            .map_err(|e| FnError::Internal(format!("bus lock poisoned: {}", e)))?;
        subjects.remove(subject);
        Ok(())
    }

    /// Answers every request on `subject` with `handler`, each on its own task.
    pub fn serve<F, Fut>(&self, subject: &str, handler: F) -> FnResult<JoinHandle<()>>
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BusReply> + Send + 'static,
    {
        let mut subscription = self.subscribe(subject)?;
        let handler = Arc::new(handler);
        Ok(tokio::spawn(async move {
            while let Some(request) = subscription.next().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let BusRequest { message, reply_tx } = request;
                    let reply = handler(message).await;
                    if reply_tx.send(reply).is_err() {
                        debug!("caller gone before reply was sent");
                    }
                });
            }
            debug!("stop serving {}", subscription.subject());
        }))
    }

    pub fn subject_count(&self) -> FnResult<usize> {
        let subjects = self
            .subjects
            .lock()
            .map_err(|e| FnError::Internal(format!("bus lock poisoned: {}", e)))?;
        Ok(subjects.len())
    }

    /// A sender whose subscription was dropped is pruned on lookup.
    fn sender_for(&self, subject: &str) -> FnResult<Option<mpsc::Sender<BusRequest>>> {
        let mut subjects = self
            .subjects
            .lock()
            .map_err(|e| FnError::Internal(format!("bus lock poisoned: {}", e)))?;
        match subjects.get(subject) {
            Some(sender) if sender.is_closed() => {
                debug!("subscriber of {} gone, removed", subject);
                subjects.remove(subject);
                Ok(None)
            }
            Some(sender) => Ok(Some(sender.clone())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn request(&self, msg: BusMessage, timeout: Duration) -> FnResult<BusReply> {
        let subject = msg.subject.clone();
        let sender = self
            .sender_for(&subject)?
            .ok_or_else(|| FnError::TransportError(format!("no responders for {}", subject)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async move {
            sender
                .send(BusRequest {
                    message: msg,
                    reply_tx,
                })
                .await
                .map_err(|_| FnError::TransportError(format!("no responders for {}", subject)))?;
            reply_rx.await.map_err(|_| {
                warn!("request on {} dropped without reply", subject);
                FnError::TransportError(format!("request on {} dropped without reply", subject))
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(FnError::TimedOut(format!(
                "no reply within {} ms",
                timeout.as_millis()
            ))),
        }
    }
}
