//! Global constants for the deadbeef agents

use std::time::Duration;

// ============================================================================
// BUFFER SIZES
// ============================================================================

/// Default read size for socket sources (8KB)
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Initial capacity of the scanner accumulation buffer
pub const SCAN_BUFFER_SIZE: usize = 1024;

/// Chunks queued between a relay and a streaming HTTP body
pub const BODY_CHANNEL_SIZE: usize = 16;

// ============================================================================
// AUTHENTICATION
// ============================================================================

/// Header carrying base64url(ProxyAuthentication) on the HTTP leg
pub const AUTH_HEADER: &str = "x-deadbeef-auth";

/// Random nonce size in a ProxyAuthentication
pub const NONCE_SIZE: usize = 16;

/// Maximum accepted distance between a token timestamp and now (15 minutes)
pub const MAX_CLOCK_SKEW_MS: i64 = 15 * 60 * 1000;

/// Message returned in a ConnectResult when auth is missing or wrong
pub const NO_AUTH_MSG: &str = "No Auth";

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Upstream connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream response timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// PORTS
// ============================================================================

/// Port assumed for CONNECT targets without one
pub const DEFAULT_HTTPS_PORT: u16 = 443;

// ============================================================================
// END OF CONSTANTS
// ============================================================================
