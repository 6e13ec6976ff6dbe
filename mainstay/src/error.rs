use std::fmt;

/// Errors reported by contexts, sources, tokens, and tasks.
///
/// Programming errors (returning a task result twice, propagating twice,
/// re-parenting a child source) are not represented here, they panic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was cancelled through a [`Cancellable`].
    ///
    /// [`Cancellable`]: crate::Cancellable
    #[error("operation was cancelled")]
    Cancelled,

    /// The source is already attached to a context.
    #[error("source is already attached to a context")]
    SourceAttached,

    /// The source has been destroyed.
    #[error("source has been destroyed")]
    SourceDestroyed,

    /// Any other failure, carrying its cause.
    #[error(transparent)]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// A `Failed` error from a plain message.
    pub fn failed(msg: impl Into<String>) -> Error {
        Error::Failed(Message(msg.into()).into())
    }

    /// True when this error is [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::failed("disk on fire").is_cancelled());
    }

    #[test]
    fn failed_keeps_message() {
        let err = Error::failed("disk on fire");
        assert_eq!(err.to_string(), "disk on fire");
    }
}
