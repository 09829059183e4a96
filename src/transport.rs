//! Delivery of commands, replies and vertex message batches.
//!
//! The conductor and the workers only see the [`Transport`] trait.
//! [`LocalTransport`] wires the nodes of an in-process cluster with tokio
//! channels, one inbox per node plus the conductor's mailbox, and can inject
//! link faults for a node.

use crate::error::TransportError;
use crate::message::{Command, CommandEnvelope, Gss, MessageBatch, ReplyEnvelope, WorkerId};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Conductor to worker.
    async fn send_command(&self, to: &WorkerId, envelope: CommandEnvelope) -> Result<(), TransportError>;

    /// Worker to conductor.
    async fn send_reply(&self, envelope: ReplyEnvelope) -> Result<(), TransportError>;

    /// Worker to worker.
    async fn send_messages(&self, to: &WorkerId, batch: MessageBatch) -> Result<(), TransportError>;
}

/// What a node receives.
#[derive(Debug, Clone)]
pub enum Packet {
    Command(CommandEnvelope),
    Messages(MessageBatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Every delivery to or from the node fails.
    Unreachable,
    /// Deliveries to or from the node are accepted and dropped.
    Silent,
}

#[derive(Debug, Clone, Copy)]
struct FaultRule {
    fault: LinkFault,
    /// The fault stays dormant until a run-superstep of at least this gss is
    /// sent to the node.
    armed_at: Option<Gss>,
}

enum Verdict {
    Deliver,
    Drop,
    Fail,
}

pub struct LocalTransport {
    nodes: RwLock<HashMap<WorkerId, mpsc::UnboundedSender<Packet>>>,
    conductor: RwLock<Option<mpsc::UnboundedSender<ReplyEnvelope>>>,
    faults: RwLock<HashMap<WorkerId, FaultRule>>,
    wire_encoding: bool,
}

impl LocalTransport {
    /// With `wire_encoding` every envelope is encoded to JSON and decoded
    /// again on delivery.
    pub fn new(wire_encoding: bool) -> Self {
        LocalTransport {
            nodes: RwLock::new(HashMap::new()),
            conductor: RwLock::new(None),
            faults: RwLock::new(HashMap::new()),
            wire_encoding,
        }
    }

    pub fn connect_node(&self, id: WorkerId) -> mpsc::UnboundedReceiver<Packet> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        receiver
    }

    pub fn connect_conductor(&self) -> mpsc::UnboundedReceiver<ReplyEnvelope> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.conductor.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        receiver
    }

    pub fn set_fault(&self, node: WorkerId, fault: LinkFault) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, FaultRule { fault, armed_at: None });
    }

    /// Arms `fault` for `node`; it fires once superstep `gss` is sent to it.
    pub fn set_fault_at(&self, node: WorkerId, fault: LinkFault, gss: Gss) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                node,
                FaultRule {
                    fault,
                    armed_at: Some(gss),
                },
            );
    }

    pub fn clear_fault(&self, node: &WorkerId) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
    }

    fn verdict(&self, node: &WorkerId, command: Option<&Command>) -> Verdict {
        let mut faults = self.faults.write().unwrap_or_else(PoisonError::into_inner);
        let Some(rule) = faults.get_mut(node) else {
            return Verdict::Deliver;
        };

        if let Some(armed_at) = rule.armed_at {
            match command {
                Some(Command::RunSuperstep(run)) if run.gss >= armed_at => {
                    debug!(worker = %node, gss = run.gss, fault = ?rule.fault, "link fault fired");
                    rule.armed_at = None;
                }
                _ => return Verdict::Deliver,
            }
        }

        match rule.fault {
            LinkFault::Unreachable => Verdict::Fail,
            LinkFault::Silent => Verdict::Drop,
        }
    }

    fn encode<T: Serialize + DeserializeOwned>(&self, value: T) -> Result<T, TransportError> {
        if !self.wire_encoding {
            return Ok(value);
        }
        let text = serde_json::to_string(&value).map_err(|e| TransportError::Encoding(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| TransportError::Encoding(e.to_string()))
    }

    fn deliver(&self, to: &WorkerId, packet: Packet) -> Result<(), TransportError> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let inbox = nodes
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        inbox
            .send(packet)
            .map_err(|_| TransportError::Unreachable(to.clone()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_command(&self, to: &WorkerId, envelope: CommandEnvelope) -> Result<(), TransportError> {
        match self.verdict(to, Some(&envelope.command)) {
            Verdict::Fail => return Err(TransportError::Unreachable(to.clone())),
            Verdict::Drop => {
                trace!(job = %envelope.job, worker = %to, command = envelope.command.tag(), "command dropped");
                return Ok(());
            }
            Verdict::Deliver => {}
        }

        let envelope = self.encode(envelope)?;
        self.deliver(to, Packet::Command(envelope))
    }

    async fn send_reply(&self, envelope: ReplyEnvelope) -> Result<(), TransportError> {
        match self.verdict(&envelope.sender, None) {
            Verdict::Fail => return Err(TransportError::NoConductor),
            Verdict::Drop => {
                trace!(job = %envelope.job, worker = %envelope.sender, "reply dropped");
                return Ok(());
            }
            Verdict::Deliver => {}
        }

        let envelope = self.encode(envelope)?;
        let conductor = self.conductor.read().unwrap_or_else(PoisonError::into_inner);
        let mailbox = conductor.as_ref().ok_or(TransportError::NoConductor)?;
        mailbox.send(envelope).map_err(|_| TransportError::NoConductor)
    }

    async fn send_messages(&self, to: &WorkerId, batch: MessageBatch) -> Result<(), TransportError> {
        for node in [to, &batch.sender] {
            match self.verdict(node, None) {
                Verdict::Fail => return Err(TransportError::Unreachable(node.clone())),
                Verdict::Drop => return Ok(()),
                Verdict::Deliver => {}
            }
        }

        let batch = self.encode(batch)?;
        self.deliver(to, Packet::Messages(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JobId, Reply, RunSuperstep};
    use std::collections::BTreeMap;
    use tokio_test::block_on;

    fn run(gss: Gss) -> CommandEnvelope {
        CommandEnvelope {
            job: JobId(1),
            command: Command::RunSuperstep(RunSuperstep {
                gss,
                vertex_count: 0,
                edge_count: 0,
                aggregators: BTreeMap::new(),
                expected_messages: BTreeMap::new(),
                compensation: false,
                epoch: 0,
            }),
        }
    }

    #[tokio::test]
    async fn test_commands_reach_the_node() {
        let transport = LocalTransport::new(true);
        let node = WorkerId::from("node-0");
        let mut inbox = transport.connect_node(node.clone());

        transport.send_command(&node, run(0)).await.unwrap();
        match inbox.recv().await {
            Some(Packet::Command(envelope)) => assert_eq!(envelope, run(0)),
            other => panic!("unexpected packet {:?}", other),
        }

        let unknown = WorkerId::from("node-9");
        assert_eq!(
            transport.send_command(&unknown, run(0)).await,
            Err(TransportError::Unreachable(unknown))
        );
    }

    #[tokio::test]
    async fn test_replies_need_a_conductor() {
        let transport = LocalTransport::new(false);
        let reply = ReplyEnvelope {
            job: JobId(1),
            sender: WorkerId::from("node-0"),
            reply: Ok(Reply::Stored),
        };
        assert_eq!(
            transport.send_reply(reply.clone()).await,
            Err(TransportError::NoConductor)
        );

        let mut mailbox = transport.connect_conductor();
        transport.send_reply(reply.clone()).await.unwrap();
        assert_eq!(mailbox.recv().await, Some(reply));
    }

    #[tokio::test]
    async fn test_armed_fault_fires_at_superstep() {
        let transport = LocalTransport::new(false);
        let node = WorkerId::from("node-1");
        let mut inbox = transport.connect_node(node.clone());
        transport.set_fault_at(node.clone(), LinkFault::Unreachable, 2);

        transport.send_command(&node, run(1)).await.unwrap();
        assert!(inbox.recv().await.is_some());
        assert!(transport.send_command(&node, run(2)).await.is_err());
        assert!(transport.send_command(&node, run(1)).await.is_err());

        transport.clear_fault(&node);
        transport.send_command(&node, run(3)).await.unwrap();
    }

    #[test]
    fn test_silent_node_drops_traffic() {
        let transport = LocalTransport::new(false);
        let node = WorkerId::from("node-2");
        let mut inbox = transport.connect_node(node.clone());
        transport.set_fault(node.clone(), LinkFault::Silent);

        tokio_test::assert_ok!(block_on(transport.send_command(&node, run(0))));
        assert!(inbox.try_recv().is_err());

        transport.clear_fault(&node);
        tokio_test::assert_ok!(block_on(transport.send_command(&node, run(1))));
        assert!(inbox.try_recv().is_ok());
        tokio_test::assert_err!(block_on(transport.send_command(&WorkerId::from("node-7"), run(1))));
    }
}
