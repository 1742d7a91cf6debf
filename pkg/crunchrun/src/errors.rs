//! Failure classes of a container run.

use pkg_client::ApiError;
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrunchError {
    /// The record was not `Locked` when the run began.
    #[error("dispatch error detected: container {uuid:?} has state {state:?}")]
    BadContainerState { uuid: String, state: String },

    #[error("{0}")]
    BadMount(String),

    #[error("too many symlinks, or symlink cycle")]
    TooManySymlinks,

    #[error("cannot output file {0:?}: not in any mount")]
    UnmappedPath(String),

    /// The runtime can't run containers on this node at all.
    #[error("{0}")]
    BrokenNode(String),

    #[error("{0}")]
    ImageMissing(String),

    #[error("{0}")]
    ContainerFailed(String),

    #[error("cancelled")]
    Cancelled,

    /// Retries exhausted in a client.
    #[error("{0}")]
    TransientIO(String),
}

impl CrunchError {
    /// The first `CrunchError` in `err`'s chain.
    pub fn of(err: &anyhow::Error) -> Option<&CrunchError> {
        err.chain().find_map(|e| e.downcast_ref::<CrunchError>())
    }

    /// Wrap `err` as `TransientIO` if a client gave up retrying, otherwise
    /// return it unchanged.
    pub fn surface_transient(err: anyhow::Error) -> anyhow::Error {
        let transient = err
            .chain()
            .filter_map(|e| e.downcast_ref::<ApiError>())
            .any(ApiError::is_transient);
        if transient && Self::of(&err).is_none() {
            CrunchError::TransientIO(err.to_string()).into()
        } else {
            err
        }
    }
}

static BROKEN_NODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"[Cc]annot connect to the Docker daemon",
        r"oci runtime error.*starting container process.*container init.*mounting.*to rootfs.*no such file or directory",
        r"grpc: the connection is unavailable",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static MISSING_EXECUTABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(exec|System error).*(no such file or directory|file not found)")
        .expect("static regex")
});

/// True if a runtime error message means this node is unusable.
pub fn is_broken_node(msg: &str) -> bool {
    BROKEN_NODE_PATTERNS.iter().any(|re| re.is_match(msg))
}

/// Advice for a start failure caused by the container's command, if the
/// message looks like one.
pub fn start_advice(msg: &str, command: &[String]) -> Option<String> {
    if !MISSING_EXECUTABLE.is_match(msg) {
        return None;
    }
    let argv0 = command.first().map(String::as_str).unwrap_or_default();
    Some(format!(
        "Possible causes: command {:?} is missing, the interpreter given in #! is missing, or script has Windows line endings.",
        argv0
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Error = CrunchError::BadMount("bad".into()).into();
        let err = err.context("While setting up mounts");
        assert_eq!(CrunchError::of(&err), Some(&CrunchError::BadMount("bad".into())));
        assert!(CrunchError::of(&anyhow::anyhow!("plain")).is_none());
    }

    #[test]
    fn test_surface_transient() {
        let api: anyhow::Error = ApiError::Transient {
            method: "GET".into(),
            url: "containers/x".into(),
            attempts: 10,
            message: "connection refused".into(),
        }
        .into();
        let err = CrunchError::surface_transient(api.context("fetch"));
        assert!(matches!(CrunchError::of(&err), Some(CrunchError::TransientIO(_))));

        let err = CrunchError::surface_transient(anyhow::anyhow!("other"));
        assert!(CrunchError::of(&err).is_none());
    }

    #[test]
    fn test_broken_node_patterns() {
        assert!(is_broken_node(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
        ));
        assert!(is_broken_node("rpc error: grpc: the connection is unavailable"));
        assert!(is_broken_node(
            "oci runtime error: starting container process caused \"process_linux.go: container init caused \\\"mounting /x to rootfs /y: no such file or directory\\\"\""
        ));
        assert!(!is_broken_node("exit status 1"));
    }

    #[test]
    fn test_start_advice() {
        let cmd = vec!["/bin/nope".to_string()];
        let advice = start_advice("exec: \"/bin/nope\": stat /bin/nope: no such file or directory", &cmd);
        assert_eq!(
            advice.as_deref(),
            Some("Possible causes: command \"/bin/nope\" is missing, the interpreter given in #! is missing, or script has Windows line endings.")
        );
        assert!(start_advice("permission denied", &cmd).is_none());
    }
}
