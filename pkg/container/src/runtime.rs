use anyhow::Result;
use pkg_constants::runtime::SUPPORTED_RUNTIMES;
use std::sync::Arc;
use std::time::Duration;

use crate::docker::DockerBackend;
use crate::executor::ContainerExecutor;
use crate::singularity::SingularityBackend;

/// Build the executor for `engine` (`docker` or `singularity`).
pub fn new_executor(
    engine: &str,
    container_uuid: &str,
    watchdog_interval: Duration,
) -> Result<Arc<dyn ContainerExecutor>> {
    let executor: Arc<dyn ContainerExecutor> = match engine {
        "docker" => Arc::new(DockerBackend::new(container_uuid, watchdog_interval)),
        "singularity" => Arc::new(SingularityBackend::new()?),
        other => anyhow::bail!(
            "unsupported runtime engine {:?} (supported: {})",
            other,
            SUPPORTED_RUNTIMES.join(", ")
        ),
    };
    tracing::info!("[runtime] using {} executor for {}", engine, container_uuid);
    Ok(executor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_engine() {
        let err = new_executor("podman", "zzzzz-dz642-000000000000000", Duration::ZERO)
            .err()
            .unwrap();
        assert!(err.to_string().contains("unsupported runtime engine \"podman\""));
    }

    #[test]
    fn test_docker_engine() {
        let e = new_executor("docker", "zzzzz-dz642-000000000000000", Duration::ZERO).unwrap();
        assert_eq!(e.cgroup_id(), "");
    }
}
