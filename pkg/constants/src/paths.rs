//! Filesystem path constants.

// ─── Process registry ─────────────────────────────────────────────────────

/// Default directory holding supervisor lockfiles.
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// Lockfile name prefix. Full name = `LOCK_PREFIX + uuid + LOCK_SUFFIX`.
pub const LOCK_PREFIX: &str = "crunch-run-";

/// Lockfile name suffix.
pub const LOCK_SUFFIX: &str = ".lock";

/// Directory-level lock, `LOCK_PREFIX + "all" + LOCK_SUFFIX`.
pub const DIR_LOCK_NAME: &str = "all";

/// Sentinel marking the node as unable to run containers.
pub const BROKEN_NODE_NAME: &str = "broken";

/// Price history written by `-list`.
pub const PRICES_FILE_NAME: &str = "prices.json";

/// Identifier used when the detached child is wrapped with systemd-cat.
pub const JOURNAL_IDENTIFIER: &str = "crunch-run";

// ─── Config ───────────────────────────────────────────────────────────────

/// Default cluster config file.
pub const DEFAULT_CLUSTER_CONFIG: &str = "/etc/arvados/config.yml";

// ─── Mounts ───────────────────────────────────────────────────────────────

/// Container path where the CA bundle is bind-mounted for API-enabled containers.
pub const CONTAINER_CA_CERT_PATH: &str = "/etc/arvados/ca-certificates.crt";

/// Host CA bundles, first readable one wins. `$SSL_CERT_FILE` is checked first.
pub const CA_CERT_CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// Mount helper binary.
pub const MOUNT_HELPER: &str = "arv-mount";

/// File the mount helper exposes once its tree is ready, relative to the mountpoint.
pub const MOUNT_READY_MARKER: &str = "by_id/README";

/// Name of the file a writable collection mount exposes its manifest through.
pub const COLLECTION_MARKER: &str = ".arvados#collection";
