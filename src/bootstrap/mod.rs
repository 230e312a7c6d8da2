//! Coordinator/Member Bootstrap
//!
//! Role resolution, the startup sequencer, the master-contact state machine
//! and emergency mode. The peer-host transport is an external collaborator;
//! its contract is the `PeerClient` trait.

pub mod emergency;
pub mod role;
pub mod startup;

pub use emergency::{restart_delay, EmergencyMode};
pub use role::{persist_role, read_role, PoolRole};
pub use startup::{StartupSequencer, StartupTask, TaskFlags};

/// Result of Pool.hello on the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloResponse {
    Ok,
    /// The coordinator could not open a connection back to us
    CannotTalkBack,
    /// The coordinator has no record of this host
    UnknownHost,
}

/// Peer transport failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
    #[error("peer transport failure: {0}")]
    Transport(String),

    /// Pool secret mismatch
    #[error("session authentication failed")]
    AuthenticationFailed,
}

/// Contract with the coordinator, carried over the pool-secret channel
pub trait PeerClient: Send + Sync {
    fn pool_hello(&self, host_uuid: &str, host_address: &str) -> Result<HelloResponse, PeerError>;
    /// The coordinator's management-stack version string
    fn master_version(&self) -> Result<String, PeerError>;
    /// Raise an administrator-visible alert on the coordinator
    fn send_alert(&self, name: &str, body: &str) -> Result<(), PeerError>;
    /// Whether the addressed host believes it is a member
    fn ask_host_if_it_is_a_slave(&self, address: &str) -> Result<bool, PeerError>;
    /// Push our PIF attachment state to the coordinator
    fn sync_pif_currently_attached(&self, pifs: &[(String, bool)]) -> Result<(), PeerError>;
}

/// Classified outcome of one master-contact attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactOutcome {
    /// Connected and compatible; proceed with the join
    Ok,
    /// Retry soon (5 s class): transient transport trouble
    Temporary(String),
    /// Retry on the long interval: unknown host, secret mismatch, or our
    /// version is ahead of the coordinator's
    Permanent(String),
}

/// Compare dotted version strings component-wise
pub fn version_newer(ours: &str, theirs: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.').map(|c| c.parse().unwrap_or(0)).collect()
    };
    parse(ours) > parse(theirs)
}

/// One attempt of the member-side contact state machine
pub fn contact_master(
    peer: &dyn PeerClient,
    my_uuid: &str,
    my_address: &str,
    my_version: &str,
) -> ContactOutcome {
    match peer.pool_hello(my_uuid, my_address) {
        Err(PeerError::AuthenticationFailed) => {
            ContactOutcome::Permanent("pool secret mismatch".to_string())
        }
        Err(PeerError::Transport(reason)) => ContactOutcome::Temporary(reason),
        Ok(HelloResponse::CannotTalkBack) => {
            ContactOutcome::Temporary("coordinator cannot talk back".to_string())
        }
        Ok(HelloResponse::UnknownHost) => {
            ContactOutcome::Permanent("unknown to the coordinator".to_string())
        }
        Ok(HelloResponse::Ok) => match peer.master_version() {
            Err(PeerError::AuthenticationFailed) => {
                ContactOutcome::Permanent("pool secret mismatch".to_string())
            }
            Err(PeerError::Transport(reason)) => ContactOutcome::Temporary(reason),
            Ok(master_version) => {
                if version_newer(my_version, &master_version) {
                    // Never join a pool run by an older coordinator
                    let body = format!(
                        "host version {} is ahead of coordinator version {}",
                        my_version, master_version
                    );
                    if let Err(e) = peer.send_alert("host_version_mismatch", &body) {
                        log::warn!("raising version alert on the coordinator: {}", e);
                    }
                    ContactOutcome::Permanent(body)
                } else {
                    ContactOutcome::Ok
                }
            }
        },
    }
}
