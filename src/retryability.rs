//! Classification of errors the change-stream resume protocol may recover
//! from.
//!
//! Kept as a standalone pure function so retry decisions can be unit-tested
//! without a cursor.

use crate::error::{Error, RESUMABLE_CHANGE_STREAM_LABEL};

/// First wire version at which servers label resumable errors themselves.
///
/// At or above this version the label is authoritative; below it the driver
/// falls back to the fixed code table.
pub const RESUMABLE_LABEL_WIRE_VERSION: i32 = 9;

/// Server code for a cursor the server no longer knows about. Resumable at
/// every wire version.
const CURSOR_NOT_FOUND: i32 = 43;

/// Server error codes denoting a recoverable loss of cursor context, used
/// when the server predates error labelling.
const RETRYABLE_SERVER_ERROR_CODES: &[(i32, &str)] = &[
    (6, "HostUnreachable"),
    (7, "HostNotFound"),
    (43, "CursorNotFound"),
    (63, "StaleShardVersion"),
    (89, "NetworkTimeout"),
    (91, "ShutdownInProgress"),
    (133, "FailedToSatisfyReadPreference"),
    (150, "StaleEpoch"),
    (189, "PrimarySteppedDown"),
    (234, "RetryChangeStream"),
    (262, "ExceededTimeLimit"),
    (9001, "SocketException"),
    (10107, "NotWritablePrimary"),
    (11600, "InterruptedAtShutdown"),
    (11602, "InterruptedDueToReplStateChange"),
    (13388, "StaleConfig"),
    (13435, "NotPrimaryNoSecondaryOk"),
    (13436, "NotPrimaryOrSecondary"),
];

/// Symbolic name for a server error code, when known.
pub(crate) fn server_code_name(code: i32) -> &'static str {
    RETRYABLE_SERVER_ERROR_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown")
}

/// Decides whether a failed fetch is eligible for resume.
///
/// Network errors are always resumable. Server errors are resumable when the
/// cursor is gone (`CursorNotFound`), when the server labelled the error as
/// resumable and the wire version makes that label reliable, or, on older
/// servers, when the code is in the fixed retryable table. Everything else
/// (missing resume tokens, decode failures, lifecycle misuse, authorization
/// and argument errors) surfaces to the caller.
pub fn is_resumable(error: &Error, max_wire_version: i32) -> bool {
    match error {
        Error::Network { .. } => true,
        Error::Server { code, labels, .. } => {
            if *code == CURSOR_NOT_FOUND {
                return true;
            }
            if max_wire_version >= RESUMABLE_LABEL_WIRE_VERSION {
                labels.iter().any(|l| l == RESUMABLE_CHANGE_STREAM_LABEL)
            } else {
                RETRYABLE_SERVER_ERROR_CODES.iter().any(|(c, _)| c == code)
            }
        }
        _ => false,
    }
}
