//! Configuration constants for the orchestrator
//!
//! This module centralizes the conventional paths, metadata keys and service limits
//! used throughout the application.

// ============================================================================
// Session Defaults
// ============================================================================

/// Experiment used when the caller does not name one
pub const DEFAULT_EXPERIMENT: &str = "Default";

/// Directory where the scheduler mounts the step's config map
pub const DEFAULT_MOUNT_PATH: &str = "/etc/config";

/// Path under the logs bucket where run logs are collected
pub const DEFAULT_LOGS_PATH: &str = "logs/";

/// Config key holding the tracking server URI
pub const TRACKING_URI_KEY: &str = "uri.mlflow";

/// Output name under which the uploaded log location is reported
pub const LOGS_PATH_OUTPUT: &str = "logs_path";

// ============================================================================
// Object Storage
// ============================================================================

/// Object metadata key holding the hex md5 of the object's content
///
/// Both backends write it on upload and compare against it before transferring,
/// so a file is only moved when its content actually changed.
pub const MD5_METADATA_KEY: &str = "md5";

/// Objects returned by a single S3 ListObjectsV2 call
///
/// S3 listings are not paginated further; anything past this page is dropped
/// with a warning.
pub const S3_LIST_PAGE_SIZE: i32 = 1000;

// ============================================================================
// Tracking
// ============================================================================

/// MLflow REST API prefix, relative to the tracking URI
pub const MLFLOW_API_PREFIX: &str = "api/2.0/mlflow/";

/// Maximum params accepted by a single MLflow log-batch request
pub const MLFLOW_MAX_PARAMS_PER_BATCH: usize = 100;

/// Maximum metrics accepted by a single MLflow log-batch request
pub const MLFLOW_MAX_METRICS_PER_BATCH: usize = 1000;

/// Environment variable carrying a bearer token for the tracking server
pub const MLFLOW_TOKEN_ENV: &str = "MLFLOW_TRACKING_TOKEN";
