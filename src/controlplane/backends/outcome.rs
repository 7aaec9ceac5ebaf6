//! Error-code translation tables
//!
//! Each adapter maps its raw code space onto [`Outcome`]. Reconcilers only
//! branch on the outcome; only destructive calls swallow [`Outcome::AbsentOk`].

use crate::domain::ports::Outcome;
use crate::error::{Error, Result};
use tracing::debug;

// =============================================================================
// REST
// =============================================================================

/// REST: entry does not exist
pub const REST_ENTRY_DOES_NOT_EXIST: &str = "4";
/// REST: no such file or directory
pub const REST_NO_SUCH_FILE: &str = "2";
/// REST: LUN map does not exist
pub const REST_LUN_MAP_NOT_FOUND: &str = "5374875";
/// REST: duplicate entry
pub const REST_DUPLICATE_ENTRY: &str = "1";
/// REST: LUN already mapped to the igroup
pub const REST_LUN_ALREADY_MAPPED: &str = "5374922";

/// Translate a REST error into an outcome
pub fn rest_outcome(status: u16, code: &str) -> Outcome {
    match code {
        REST_ENTRY_DOES_NOT_EXIST | REST_NO_SUCH_FILE | REST_LUN_MAP_NOT_FOUND => {
            return Outcome::AbsentOk
        }
        REST_DUPLICATE_ENTRY | REST_LUN_ALREADY_MAPPED => return Outcome::Conflict,
        _ => {}
    }
    match status {
        404 => Outcome::AbsentOk,
        409 => Outcome::Conflict,
        429 | 502 | 503 | 504 => Outcome::Transient,
        _ => Outcome::Fatal,
    }
}

// =============================================================================
// ZAPI
// =============================================================================

/// ZAPI: no such file or directory
pub const EONTAPI_ENOENT: u32 = 2;
/// ZAPI: entry already exists
pub const EEXIST: u32 = 17;
/// ZAPI: object busy
pub const EBUSY: u32 = 16;
/// ZAPI: LUN map does not exist
pub const EVDISK_ERROR_NO_SUCH_LUNMAP: u32 = 9016;
/// ZAPI: LUN does not exist
pub const EVDISK_ERROR_NO_SUCH_VDISK: u32 = 9017;
/// ZAPI: LUN already mapped
pub const EVDISK_ERROR_INITGROUP_HAS_VDISK: u32 = 9029;
/// ZAPI: volume does not exist
pub const EVOLUMEDOESNOTEXIST: u32 = 13040;
/// ZAPI: volume already offline
pub const EVOLUMEOFFLINE: u32 = 13042;
/// ZAPI: volume busy with another operation
pub const EVOLOPNOTSUPP_BUSY: u32 = 13001;
/// ZAPI: entry does not exist
pub const ENTRYDOESNOTEXIST: u32 = 15661;
/// ZAPI: duplicate entry
pub const EDUPLICATEENTRY: u32 = 13130;

/// Translate a ZAPI error number into an outcome
pub fn zapi_outcome(errno: u32) -> Outcome {
    match errno {
        EONTAPI_ENOENT
        | EVDISK_ERROR_NO_SUCH_LUNMAP
        | EVDISK_ERROR_NO_SUCH_VDISK
        | EVOLUMEDOESNOTEXIST
        | EVOLUMEOFFLINE
        | ENTRYDOESNOTEXIST => Outcome::AbsentOk,
        EEXIST | EVDISK_ERROR_INITGROUP_HAS_VDISK | EDUPLICATEENTRY => Outcome::Conflict,
        EBUSY | EVOLOPNOTSUPP_BUSY => Outcome::Transient,
        _ => Outcome::Fatal,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Backend error carrying a translated outcome
pub fn backend_error(
    operation: &str,
    outcome: Outcome,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Error {
    Error::Backend {
        operation: operation.to_string(),
        outcome,
        code: code.into(),
        message: message.into(),
    }
}

/// Treat an absent target as success; used by destructive calls only
pub fn absent_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::Backend {
            operation,
            outcome: Outcome::AbsentOk,
            code,
            ..
        }) => {
            debug!("{}: target already absent [{}]", operation, code);
            Ok(())
        }
        other => other,
    }
}
