//! Pass-through strategy: no pacing, output forwarded as it arrives.

use async_trait::async_trait;
use serialhub_core::{Broadcaster, OutboundMessage};
use std::sync::Arc;

use super::{BufferAlgorithm, FlowContext, FlowController, Readiness};

pub struct NoOpFlow {
    port: String,
    broadcaster: Arc<dyn Broadcaster>,
}

impl NoOpFlow {
    pub fn new(ctx: FlowContext) -> Self {
        Self {
            port: ctx.port,
            broadcaster: ctx.broadcaster,
        }
    }
}

#[async_trait]
impl FlowController for NoOpFlow {
    fn algorithm(&self) -> BufferAlgorithm {
        BufferAlgorithm::Default
    }

    fn on_incoming_data(&self, data: &str) {
        if data.is_empty() {
            return;
        }
        self.broadcaster
            .broadcast(OutboundMessage::data(&self.port, data));
    }

    async fn block_until_ready(&self, _cmd: &str, _id: &str) -> Readiness {
        Readiness::Proceed {
            handled_elsewhere: false,
        }
    }

    fn close(&self) {}
}
