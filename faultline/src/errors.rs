#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the socket name is invalid")]
    InvalidName,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("client process has an unknown or invalid pid")]
    UnknownClientPid,
    #[error("protocol error, expected version '{expected}' but received '{received}'")]
    ProtocolMismatch { expected: u16, received: u16 },
    #[error("received a malformed message of kind {0}")]
    MalformedMessage(u16),
    #[error("a crash notification was sent before registration completed")]
    NotRegistered,
    #[error("timed out waiting for the supervisor to acknowledge")]
    AckTimeout,
    #[error("report {0} was concurrently transitioned")]
    StaleState(uuid::Uuid),
    #[error("report {0} does not exist")]
    UnknownReport(uuid::Uuid),
    #[error("dump artifact is truncated or corrupt")]
    CorruptArtifact,
    #[error("failed to inspect process {pid}: {source}")]
    Inspect { pid: i32, source: nix::Error },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Scroll(#[from] scroll::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
