//! Validation bounds shared across the gateway.
//!
//! Centralizing these keeps the request validators, the repositories, and
//! the tests in agreement about what the gateway accepts.

/// Maximum length of a device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 255;

/// Maximum length of a device display name.
pub const MAX_DEVICE_NAME_LEN: usize = 255;

/// Maximum length of a firmware version string.
pub const MAX_VERSION_LEN: usize = 50;

/// Maximum length of a metadata key.
pub const MAX_METADATA_KEY_LEN: usize = 100;

/// Maximum length of a metadata value in string form.
pub const MAX_METADATA_VALUE_LEN: usize = 1000;

/// Maximum command timeout in seconds (one hour).
pub const MAX_COMMAND_TIMEOUT_SECS: i32 = 3600;

/// Default page size for list operations.
pub const DEFAULT_PAGE_SIZE: i32 = 50;

/// Maximum page size for device listings.
pub const MAX_DEVICE_PAGE_SIZE: i32 = 1000;

/// Maximum page size for measurement queries.
pub const MAX_MEASUREMENT_PAGE_SIZE: i32 = 10_000;
