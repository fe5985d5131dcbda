//! Audio Pipeline Boundary
//!
//! The audio encode/decode pipeline is a single shared resource per role and
//! lives outside this crate. The state machine drives it with fire-and-forget
//! [`AudioCommand`]s: session lifecycle for the active peer, tx/rx flush
//! control, and the started/stopped/suspended acknowledgements the pipeline
//! consumes. Only the active peer's transitions may touch the shared
//! session; the gating is done by the state machine before posting.

use crate::codec::CodecPreferences;
use crate::event::TransportStatus;
use crate::{AUDIO_CHANNEL, PeerAddress, Role};

/// What the pipeline is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCommandKind {
    /// A peer returned to Idle; stop pipeline activity for it
    OnIdle {
        /// The peer that went idle
        address: PeerAddress,
    },
    /// Acknowledge a stream start to the pipeline
    OnStarted {
        /// The peer whose stream started
        address: PeerAddress,
        /// Outcome to acknowledge
        status: TransportStatus,
    },
    /// The stream stopped; stop the encoder/decoder until resumed
    OnStopped,
    /// The stream suspended
    OnSuspended {
        /// The local side initiated the suspend
        initiator: bool,
    },
    /// Acknowledge an offload-start outcome
    OnOffloadStarted {
        /// The peer whose stream was offloaded
        address: PeerAddress,
        /// Outcome to acknowledge
        status: TransportStatus,
    },
    /// Flush or unflush the transmit path
    SetTxFlush(bool),
    /// Flush or unflush the receive path
    SetRxFlush(bool),
    /// Start the shared session for a peer
    StartSession {
        /// The session's peer
        address: PeerAddress,
    },
    /// End the shared session for a peer
    EndSession {
        /// The session's peer
        address: PeerAddress,
    },
    /// Restart the shared session when the active peer changes
    RestartSession {
        /// Previously active peer (may be empty)
        previous: PeerAddress,
        /// Newly active peer
        address: PeerAddress,
    },
    /// Shut the pipeline down
    Shutdown,
    /// Forward updated encoder codec preferences
    UpdateEncoderConfig {
        /// The peer the preferences apply to
        address: PeerAddress,
        /// The client's codec preferences
        preferences: CodecPreferences,
    },
}

/// One command for the audio pipeline of one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCommand {
    /// Which role's pipeline the command targets
    pub role: Role,
    /// The command itself
    pub kind: AudioCommandKind,
}

/// Post a command to the audio pipeline of `role`
pub(crate) fn command(role: Role, kind: AudioCommandKind) {
    if AUDIO_CHANNEL.try_send(AudioCommand { role, kind }).is_err() {
        defmt::error!("[AUDIO] command channel full, dropping command");
    }
}

/// Receive the next audio pipeline command.
///
/// Intended for the external audio pipeline's task.
pub async fn next_command() -> AudioCommand {
    AUDIO_CHANNEL.receive().await
}
