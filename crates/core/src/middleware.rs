//! Chain-of-responsibility middleware.
//!
//! A chain is a flat, ordered list of stages fixed at registration time.
//! Each stage receives the envelope and a [`Next`] continuation borrowing
//! the remaining tail; returning without calling `next` short-circuits the
//! rest of the chain without an error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::errors::KewError;
use crate::message::Message;

#[async_trait]
pub trait Middleware<M: Message>: Send + Sync + 'static {
    /// Stable identity used to reject duplicate registrations of the same
    /// stage on one chain.
    fn id(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn handle(
        &self,
        envelope: &mut Envelope<M>,
        next: Next<'_, M>,
    ) -> Result<(), KewError>;
}

/// Continuation over the unexecuted tail of a chain.
pub struct Next<'a, M: Message> {
    rest: &'a [Arc<dyn Middleware<M>>],
}

impl<'a, M: Message> Next<'a, M> {
    pub async fn run(self, envelope: &mut Envelope<M>) -> Result<(), KewError> {
        match self.rest.split_first() {
            Some((head, rest)) => head.handle(envelope, Next { rest }).await,
            None => Ok(()),
        }
    }
}

/// A pre-composed, immutable chain.
#[derive(Clone)]
pub struct Pipeline<M: Message> {
    stages: Arc<[Arc<dyn Middleware<M>>]>,
}

impl<M: Message> Pipeline<M> {
    pub fn new(stages: Vec<Arc<dyn Middleware<M>>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    pub async fn run(&self, envelope: &mut Envelope<M>) -> Result<(), KewError> {
        Next { rest: &self.stages }.run(envelope).await
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        const TYPE_ID: &'static str = "ping";
    }

    struct Trace {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        call_next: bool,
    }

    #[async_trait]
    impl Middleware<Ping> for Trace {
        async fn handle(
            &self,
            envelope: &mut Envelope<Ping>,
            next: Next<'_, Ping>,
        ) -> Result<(), KewError> {
            self.log.lock().push(self.label);
            if self.call_next {
                next.run(envelope).await
            } else {
                Ok(())
            }
        }
    }

    fn stage(
        label: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        call_next: bool,
    ) -> Arc<dyn Middleware<Ping>> {
        Arc::new(Trace {
            label,
            log: log.clone(),
            call_next,
        })
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Pipeline::new(vec![
            stage("a", &log, true),
            stage("b", &log, true),
            stage("c", &log, true),
        ]);

        let mut env = Envelope::for_publish(Ping { n: 1 });
        chain.run(&mut env).await.unwrap();

        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn not_calling_next_halts_the_rest_without_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Pipeline::new(vec![
            stage("a", &log, true),
            stage("b", &log, false),
            stage("c", &log, true),
        ]);

        let mut env = Envelope::for_publish(Ping { n: 1 });
        let result = chain.run(&mut env).await;

        assert!(result.is_ok());
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }
}
