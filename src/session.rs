// THEORY:
// A session is one video being analysed. Each session is a `LiveProcessor` that
// exclusively owns its stages; nothing is shared between sessions. The
// `SessionRegistry` only keeps a `ControlHandle` per session: a channel sender
// through which outside callers (an HTTP handler, a CLI schedule) ask for
// halftime toggles or a team reset. The processor applies them between frames,
// so the session state never needs a lock.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tracing::info;

use crate::core_modules::detection::Detector;
use crate::core_modules::frame_source::FrameSource;
use crate::core_modules::offside::AttackDirection;
use crate::error::{Result, VisionError};
use crate::pipeline::{LiveProcessor, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ToggleHalftime,
    ResetTeams,
}

/// Sends commands to a running session.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: mpsc::UnboundedSender<SessionCommand>,
}

impl ControlHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { sender }
    }

    /// Queues a command. Returns `false` once the session has been dropped.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.sender.send(command).is_ok()
    }

    pub fn toggle_halftime(&self) -> bool {
        self.send(SessionCommand::ToggleHalftime)
    }

    pub fn reset_teams(&self) -> bool {
        self.send(SessionCommand::ResetTeams)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, ControlHandle>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new session. The caller drives the returned processor; the
    /// registry keeps only its control handle.
    pub fn create_session<S, D>(
        &mut self,
        source: S,
        detector: D,
        team1_direction: AttackDirection,
        config: PipelineConfig,
    ) -> Result<(SessionId, LiveProcessor)>
    where
        S: FrameSource + 'static,
        D: Detector + 'static,
    {
        let processor = LiveProcessor::open(source, detector, team1_direction, config)?;
        self.prune_closed();
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(id, processor.control_handle());
        info!(session = %id, "session created");
        Ok((id, processor))
    }

    /// Drops the handles of sessions whose processor is gone.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, handle| {
            let open = !handle.is_closed();
            if !open {
                info!(session = %id, "session ended without close; pruned");
            }
            open
        });
        before - self.sessions.len()
    }

    pub fn handle(&self, id: SessionId) -> Option<&ControlHandle> {
        self.sessions.get(&id)
    }

    fn send(&mut self, id: SessionId, command: SessionCommand) -> Result<()> {
        let handle = self.sessions.get(&id).ok_or(VisionError::UnknownSession(id))?;
        if handle.send(command) {
            return Ok(());
        }
        self.sessions.remove(&id);
        Err(VisionError::SessionClosed(id))
    }

    pub fn toggle_halftime(&mut self, id: SessionId) -> Result<()> {
        self.send(id, SessionCommand::ToggleHalftime)
    }

    pub fn reset_teams(&mut self, id: SessionId) -> Result<()> {
        self.send(id, SessionCommand::ResetTeams)
    }

    /// Forgets a session. Returns whether it was known.
    pub fn close(&mut self, id: SessionId) -> bool {
        let known = self.sessions.remove(&id).is_some();
        if known {
            info!(session = %id, "session closed");
        }
        known
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
