//! Card command sequencer
//!
//! Every [`CardConnection`] owns one worker thread holding the card. Commands
//! travel to the worker over a crossbeam channel and their outcome comes back
//! over a oneshot channel, so async callers never block on card I/O. At most
//! one command is outstanding per connection.

mod worker;

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    thread,
};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::{
    Card, CardError, CardReturnCode, ReaderInfo,
    command::{CardCommand, CommandOutcome},
};

use worker::Worker;

/// Hands a card back once its worker stops
pub(crate) type Release = Box<dyn FnOnce(Box<dyn Card>, ReaderInfo) + Send>;

/// Worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Largest APDU forwarded by `Transmit`, 0 for the reader's own limit
    pub max_apdu_length: usize,
    /// Name prefix of worker threads
    pub worker_name: String,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_apdu_length: 0,
            worker_name: "eid-card".to_owned(),
        }
    }
}

/// Errors of the sequencer itself, as opposed to card failures
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    /// A command was submitted before the previous one completed
    #[error("A command is already in flight on this connection")]
    CommandInFlight,

    /// The worker has stopped
    #[error("The card connection is closed")]
    Disconnected,

    /// The worker thread could not be started
    #[error("Failed to start the card worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// Connecting to the card failed
    #[error(transparent)]
    Card(#[from] CardError),
}

/// Secure channel currently in place on a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Plain communication
    #[default]
    None,
    /// PACE secure messaging
    Pace,
    /// Chip authenticated; APDUs are protected by the service provider
    ChipAuthenticated,
}

/// State shared between connection handles and the worker
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) in_flight: AtomicBool,
    pub(crate) reader: RwLock<ReaderInfo>,
    pub(crate) channel: RwLock<ChannelState>,
}

/// A job for the worker
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) command: CardCommand,
    pub(crate) reply: oneshot::Sender<CommandOutcome>,
}

#[derive(Debug)]
pub(crate) enum Message {
    Run(Job),
    Disconnect,
}

/// Exclusive handle on a connected card
///
/// Clones share the same worker. The card is disconnected and released when
/// [`CardConnection::disconnect`] is called or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct CardConnection {
    sender: Sender<Message>,
    shared: Arc<Shared>,
}

impl CardConnection {
    /// Connect `card` and start its worker
    pub fn open(mut card: Box<dyn Card>, info: ReaderInfo, config: SequencerConfig) -> Result<Self, SequencerError> {
        card.connect()?;
        Self::spawn(card, info, config, Box::new(|_, _| {}))
    }

    /// Start the worker for an already connected card
    pub(crate) fn spawn(
        card: Box<dyn Card>,
        info: ReaderInfo,
        config: SequencerConfig,
        release: Release,
    ) -> Result<Self, SequencerError> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            in_flight: AtomicBool::new(false),
            reader: RwLock::new(info),
            channel: RwLock::new(ChannelState::None),
        });

        let name = format!("{}-{}", config.worker_name, shared.reader.read().name);
        let worker = Worker::new(card, config, Arc::clone(&shared));
        thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(receiver, release))?;

        debug!(reader = %shared.reader.read().name, "Card connection opened");
        Ok(Self { sender, shared })
    }

    /// Hand `command` to the worker
    ///
    /// Fails with [`SequencerError::CommandInFlight`] while a previous command
    /// has not completed.
    pub fn submit(&self, command: CardCommand) -> Result<PendingCommand, SequencerError> {
        if self.shared.in_flight.swap(true, Ordering::AcqRel) {
            error!(
                reader = %self.reader_name(),
                command = command.name(),
                "Command submitted while another one is in flight"
            );
            return Err(SequencerError::CommandInFlight);
        }

        let (reply, receiver) = oneshot::channel();
        if self.sender.send(Message::Run(Job { command, reply })).is_err() {
            self.shared.in_flight.store(false, Ordering::Release);
            return Err(SequencerError::Disconnected);
        }
        Ok(PendingCommand { receiver })
    }

    /// Submit `command` and wait for its outcome
    pub async fn execute(&self, command: CardCommand) -> Result<CommandOutcome, SequencerError> {
        Ok(self.submit(command)?.await)
    }

    /// Stop the worker after the current command
    pub fn disconnect(&self) {
        // a stopped worker has already released the card
        let _ = self.sender.send(Message::Disconnect);
    }

    /// Name of the reader holding the card
    pub fn reader_name(&self) -> String {
        self.shared.reader.read().name.clone()
    }

    /// Latest known state of the reader and card
    pub fn reader_info(&self) -> ReaderInfo {
        self.shared.reader.read().clone()
    }

    /// Secure channel currently in place
    pub fn channel_state(&self) -> ChannelState {
        *self.shared.channel.read()
    }

    /// Whether a command is outstanding
    pub fn is_busy(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

/// Outcome of a submitted command
///
/// Resolves exactly once. A worker that stopped before answering yields
/// `COMMAND_FAILED`.
#[derive(Debug)]
#[must_use = "the outcome of a card command should be checked"]
pub struct PendingCommand {
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl Future for PendingCommand {
    type Output = CommandOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| CommandOutcome::failed(CardReturnCode::CommandFailed)))
    }
}
