//! Commands submitted from other threads.
//!
//! The engine is single-writer. Hosts that mutate it from several threads
//! send [`Command`]s through a [`CommandSender`]; the engine drains the
//! channel into its [`CommandQueue`] and applies the commands, in
//! submission order, at the start of the next `advance`.

use crate::fixed::{Fixed64, Ticks};
use crate::graph::{FlowConnection, FlowNode};
use crate::id::*;
use crate::recipe::ConversionRecipe;
use crate::chain::ConversionChain;
use std::sync::mpsc;

/// A single deferred engine operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RegisterNode(FlowNode),
    UnregisterNode(NodeId),
    RegisterConnection(FlowConnection),
    UnregisterConnection(ConnectionId),
    CreateFlow {
        source: NodeId,
        target: NodeId,
        amounts: Vec<(ResourceType, Fixed64)>,
    },
    UpdateResourceAmount {
        node: NodeId,
        resource: ResourceType,
        delta: Fixed64,
    },
    SetNodeActive { node: NodeId, active: bool },
    SetConnectionActive { connection: ConnectionId, active: bool },
    RegisterRecipe(ConversionRecipe),
    RegisterChain(ConversionChain),
    StartChain {
        chain: ChainId,
        initial_converter: Option<NodeId>,
    },
    SetConversionRate {
        source: ResourceType,
        target: ResourceType,
        rate: Fixed64,
    },
    StartProcess { converter: NodeId, recipe: RecipeId },
    CancelProcess(ProcessId),
    CancelChain(ExecutionId),
}

/// Clonable handle that submits commands to an engine.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
}

impl CommandSender {
    /// Submit a command. Returns `false` if the engine is gone.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }
}

/// Pending commands plus a bounded history of applied ones.
#[derive(Debug)]
pub struct CommandQueue {
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    pending: Vec<Command>,
    /// Applied commands: (tick, command).
    history: Vec<(Ticks, Command)>,
    /// Maximum history entries to retain. 0 = no history.
    max_history: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::with_max_history(0)
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that retains up to `max_history` applied commands.
    pub fn with_max_history(max_history: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            pending: Vec::new(),
            history: Vec::new(),
            max_history,
        }
    }

    /// A new handle for submitting commands from any thread.
    pub fn sender(&self) -> CommandSender {
        CommandSender { tx: self.tx.clone() }
    }

    /// Queue a command directly (same thread as the engine).
    pub fn push(&mut self, command: Command) {
        self.pending.push(command);
    }

    /// Pull everything sent through senders into the pending list, then drain
    /// it, recording the commands in history under `tick`.
    pub fn drain(&mut self, tick: Ticks) -> Vec<Command> {
        self.pending.extend(self.rx.try_iter());
        let commands: Vec<Command> = self.pending.drain(..).collect();

        if self.max_history > 0 {
            for cmd in &commands {
                self.history.push((tick, cmd.clone()));
            }
            let excess = self.history.len().saturating_sub(self.max_history);
            if excess > 0 {
                self.history.drain(..excess);
            }
        }
        commands
    }

    /// Commands queued locally; channel contents are only counted once drained.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn history(&self) -> &[(Ticks, Command)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn drain_returns_local_and_channel_commands_in_order() {
        let mut queue = CommandQueue::new();
        queue.push(Command::UnregisterNode(NodeId::from("a")));
        let sender = queue.sender();
        thread::spawn(move || {
            sender.send(Command::UnregisterNode(NodeId::from("b")));
        })
        .join()
        .unwrap();

        let drained = queue.drain(0);
        assert_eq!(
            drained,
            vec![
                Command::UnregisterNode(NodeId::from("a")),
                Command::UnregisterNode(NodeId::from("b")),
            ]
        );
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut queue = CommandQueue::with_max_history(2);
        for (tick, id) in ["a", "b", "c"].into_iter().enumerate() {
            queue.push(Command::CancelProcess(ProcessId(tick as u64)));
            queue.push(Command::UnregisterNode(NodeId::from(id)));
            queue.drain(tick as Ticks);
        }
        let history = queue.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].0, 2);
        assert_eq!(history[1].1, Command::UnregisterNode(NodeId::from("c")));
    }

    #[test]
    fn no_history_by_default() {
        let mut queue = CommandQueue::new();
        queue.push(Command::CancelChain(ExecutionId(1)));
        queue.drain(5);
        assert!(queue.history().is_empty());
    }
}
