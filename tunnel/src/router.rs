use anyhow::Context;
use async_trait::async_trait;
use devtunnel_protocol::{AgentInfo, AgentsPayload, Inbound, SessionInvocation, TYPE_AGENTS, TYPE_OUTPUT};
use tokio_util::sync::CancellationToken;

use crate::bridge::InvocationBridge;
use crate::relay::{InboundHandler, RelaySender};

/// Answers agent discovery and runs session invocations, one frame at a time.
pub struct InboundRouter {
    agents: AgentsPayload,
    relay: RelaySender,
    bridge: InvocationBridge,
    cancel: CancellationToken,
}

impl InboundRouter {
    pub fn new(
        agents: Vec<AgentInfo>,
        relay: RelaySender,
        bridge: InvocationBridge,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agents: AgentsPayload { agents },
            relay,
            bridge,
            cancel,
        }
    }

    async fn invoke(&self, invocation: SessionInvocation) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            tracing::debug!(session_id=%invocation.session_id, "session is shutting down; ignoring invocation");
            return Ok(());
        }
        let request = invocation.to_request().map_err(|err| {
            tracing::debug!(error=%err, "failed to decode payload");
            err
        })?;
        let output = match self.bridge.invoke(&invocation.agent_id, &request).await {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(error=%format!("{err:#}"), agent_id=%invocation.agent_id, "failed to post to agent");
                return Err(err);
            }
        };
        self.relay
            .send(&output, TYPE_OUTPUT)
            .await
            .context("send output message")
    }
}

#[async_trait]
impl InboundHandler for InboundRouter {
    async fn handle(&self, frame: &str) -> anyhow::Result<()> {
        let inbound = Inbound::decode(frame).map_err(|err| {
            tracing::debug!(error=%err, "failed to unmarshal inbound message");
            err
        })?;
        match inbound {
            Inbound::AgentDiscovery => {
                tracing::trace!(count = self.agents.agents.len(), "sending agents");
                self.relay
                    .send(&self.agents, TYPE_AGENTS)
                    .await
                    .context("send agents message")
            }
            Inbound::Invocation(invocation) => self.invoke(invocation).await,
        }
    }
}
