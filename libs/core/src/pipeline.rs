//! Ordered middleware chain shared by producers and consumers.
//!
//! A pipeline is a slice of [`Behavior`] stages wrapped around one [`Terminal`]
//! action. Each stage receives the context and a [`Next`] continuation bound to
//! the rest of the chain; it may edit the context, decline to continue, inspect
//! the outcome after continuing, or wrap the continuation to react to failures.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::BridgeResult;

/// Shared handle to a pipeline stage.
pub type SharedBehavior<C> = Arc<dyn Behavior<C>>;

/// One unit of middleware.
#[async_trait]
pub trait Behavior<C: Send + 'static>: Send + Sync {
    /// Handles the context; call `next.run(context)` to continue down the chain.
    async fn handle(&self, context: &mut C, next: Next<'_, C>) -> BridgeResult<()>;
}

/// Action at the end of the chain; the only place allowed to cause external effects.
#[async_trait]
pub trait Terminal<C: Send + 'static>: Send + Sync {
    async fn invoke(&self, context: &mut C) -> BridgeResult<()>;
}

/// Continuation bound to the remainder of a pipeline.
pub struct Next<'a, C: Send + 'static> {
    stages: &'a [SharedBehavior<C>],
    terminal: &'a dyn Terminal<C>,
}

impl<C: Send + 'static> Clone for Next<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Send + 'static> Copy for Next<'_, C> {}

impl<'a, C: Send + 'static> Next<'a, C> {
    /// Number of stages left before the terminal action.
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }

    pub async fn run(self, context: &mut C) -> BridgeResult<()> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    terminal: self.terminal,
                };
                stage.handle(context, next).await
            }
            None => self.terminal.invoke(context).await,
        }
    }
}

/// Runs `stages` in order around `terminal`.
pub async fn execute<C: Send + 'static>(
    stages: &[SharedBehavior<C>],
    context: &mut C,
    terminal: &dyn Terminal<C>,
) -> BridgeResult<()> {
    Next { stages, terminal }.run(context).await
}
