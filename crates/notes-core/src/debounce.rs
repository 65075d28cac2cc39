//! Client-side coalescing of edits.
//!
//! An editor reports every keystroke to a [`DebouncedEmitter`]. The emitter
//! sends one `live_update` carrying the latest snapshot once typing has been
//! quiet for the configured period, or immediately on an explicit save. A
//! single task owns both the timer and the save path, so a save can never race
//! the timer into a double send.

use async_trait::async_trait;
use std::time::Duration;
use studynotes_protocol::{room_for, ClientEvent, NoteId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// Quiet period after the last keystroke before an update is sent.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1500);

/// Emitter errors.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The sink no longer accepts updates.
    #[error("Update sink closed")]
    SinkClosed,

    /// The emitter task has stopped.
    #[error("Emitter stopped")]
    Stopped,
}

/// Destination of emitted updates.
#[async_trait]
pub trait UpdateSink: Send + 'static {
    /// Send one update.
    async fn emit(&mut self, event: ClientEvent) -> Result<(), EmitError>;
}

#[async_trait]
impl UpdateSink for mpsc::UnboundedSender<ClientEvent> {
    async fn emit(&mut self, event: ClientEvent) -> Result<(), EmitError> {
        self.send(event).map_err(|_| EmitError::SinkClosed)
    }
}

#[async_trait]
impl UpdateSink for mpsc::Sender<ClientEvent> {
    async fn emit(&mut self, event: ClientEvent) -> Result<(), EmitError> {
        self.send(event).await.map_err(|_| EmitError::SinkClosed)
    }
}

/// Emitter configuration.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Room updates are sent to.
    pub room: String,
    /// Note the room is backed by.
    pub note_id: Option<NoteId>,
    /// Quiet period before a pending edit is sent.
    pub quiet_period: Duration,
}

impl EmitterConfig {
    /// Configuration for editing a note, or the default room without one.
    #[must_use]
    pub fn for_note(note_id: Option<NoteId>) -> Self {
        Self {
            room: room_for(note_id.as_ref()),
            note_id,
            quiet_period: DEFAULT_QUIET_PERIOD,
        }
    }

    /// Override the quiet period.
    #[must_use]
    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }
}

/// Whether an emission is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    /// Nothing waiting to be sent.
    Idle,
    /// An edit is waiting for the quiet period to pass.
    Pending,
}

/// Counters reported when the emitter stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    /// Local edits received.
    pub edits: u64,
    /// Updates sent to the sink.
    pub emissions: u64,
}

enum Command {
    Edit(String),
    Remote(String),
    Save,
    State(oneshot::Sender<EmitterState>),
    Close,
}

/// Debounces local edits into `live_update` events.
pub struct DebouncedEmitter {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<EmitterStats>,
}

impl DebouncedEmitter {
    /// Start an emitter for a document whose current content is `initial`.
    #[must_use]
    pub fn spawn<S: UpdateSink>(config: EmitterConfig, initial: String, sink: S) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, initial, sink, rx));
        Self { commands, task }
    }

    /// Record a local edit and restart the quiet period.
    ///
    /// # Errors
    ///
    /// Returns an error if the emitter has stopped.
    pub fn edit(&self, content: impl Into<String>) -> Result<(), EmitError> {
        self.send(Command::Edit(content.into()))
    }

    /// Send the current snapshot now, cancelling any pending emission.
    ///
    /// # Errors
    ///
    /// Returns an error if the emitter has stopped.
    pub fn save(&self) -> Result<(), EmitError> {
        self.send(Command::Save)
    }

    /// Replace the local snapshot with content received from the room.
    ///
    /// Does not emit and leaves a pending emission scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the emitter has stopped.
    pub fn apply_remote(&self, content: impl Into<String>) -> Result<(), EmitError> {
        self.send(Command::Remote(content.into()))
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the emitter has stopped.
    pub async fn state(&self) -> Result<EmitterState, EmitError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx))?;
        rx.await.map_err(|_| EmitError::Stopped)
    }

    /// Flush any pending emission and stop.
    pub async fn close(self) -> EmitterStats {
        let _ = self.commands.send(Command::Close);
        self.task.await.unwrap_or_default()
    }

    fn send(&self, command: Command) -> Result<(), EmitError> {
        self.commands.send(command).map_err(|_| EmitError::Stopped)
    }
}

async fn run<S: UpdateSink>(
    config: EmitterConfig,
    mut content: String,
    mut sink: S,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> EmitterStats {
    let mut stats = EmitterStats::default();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                biased;

                command = commands.recv() => command,

                () = sleep_until(at) => {
                    deadline = None;
                    trace!(room = %config.room, "Quiet period elapsed");
                    if emit(&config, &content, &mut sink, &mut stats).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            None => commands.recv().await,
        };

        match command {
            Some(Command::Edit(snapshot)) => {
                content = snapshot;
                stats.edits += 1;
                deadline = Some(Instant::now() + config.quiet_period);
            }
            Some(Command::Remote(snapshot)) => {
                content = snapshot;
            }
            Some(Command::Save) => {
                deadline = None;
                if emit(&config, &content, &mut sink, &mut stats).await.is_err() {
                    break;
                }
            }
            Some(Command::State(reply)) => {
                let state = if deadline.is_some() {
                    EmitterState::Pending
                } else {
                    EmitterState::Idle
                };
                let _ = reply.send(state);
            }
            Some(Command::Close) | None => {
                if deadline.take().is_some() {
                    let _ = emit(&config, &content, &mut sink, &mut stats).await;
                }
                break;
            }
        }
    }

    debug!(
        room = %config.room,
        edits = stats.edits,
        emissions = stats.emissions,
        "Emitter stopped"
    );
    stats
}

async fn emit<S: UpdateSink>(
    config: &EmitterConfig,
    content: &str,
    sink: &mut S,
    stats: &mut EmitterStats,
) -> Result<(), EmitError> {
    let event = ClientEvent::live_update(config.room.clone(), content, config.note_id.clone());
    match sink.emit(event).await {
        Ok(()) => {
            stats.emissions += 1;
            Ok(())
        }
        Err(e) => {
            warn!(room = %config.room, error = %e, "Dropping update, sink closed");
            Err(e)
        }
    }
}
