//! Centralized constants for the cache crate
//!
//! Group ids, annotation names and defaults used across the coordinator.

// =============================================================================
// Groups
// =============================================================================

/// Group whose requests are collected for one tick and then sent as a batch.
pub const AUTO_GROUP: &str = "$auto";

/// Group whose requests are sent immediately, one by one, without `$batch`.
pub const DIRECT_GROUP: &str = "$direct";

// =============================================================================
// Payload annotations
// =============================================================================

/// Instance annotation carrying an entity's ETag.
pub const ETAG_ANNOTATION: &str = "@odata.etag";

/// Instance annotation carrying the server-side count of a collection.
pub const COUNT_ANNOTATION: &str = "@odata.count";

/// Property name of a collection payload.
pub const VALUE_PROPERTY: &str = "value";

/// `If-Match` value used when ETags are ignored.
pub const ANY_ETAG: &str = "*";

// =============================================================================
// Defaults
// =============================================================================

/// Default `$top` for collection reads that do not name a length.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Prefix of client-generated transient ids, followed by a counter.
pub const TRANSIENT_UID_PREFIX: &str = "id-";
