//! Characteristic lookup over a GATT object tree snapshot.

use crate::domain::errors::ResolveError;
use crate::domain::gatt::{Capability, CharacteristicSet, ObjectTree};
use crate::domain::models::ObjectPath;
use tracing::{debug, warn};

/// Result of a resolution, including how many extra matches were ignored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub characteristics: CharacteristicSet,
    pub duplicate_write: usize,
    pub duplicate_notify: usize,
}

impl Resolution {
    /// More than one characteristic matched a UUID; the first one was used
    pub fn is_ambiguous(&self) -> bool {
        self.duplicate_write > 0 || self.duplicate_notify > 0
    }
}

/// Find the write and notify characteristics of `device` by UUID.
///
/// Only characteristic objects below `device` are considered. UUIDs compare
/// case-insensitively. When several objects carry the same UUID the first in
/// snapshot order wins.
pub fn resolve(
    tree: &ObjectTree,
    device: &ObjectPath,
    write_uuid: &str,
    notify_uuid: &str,
) -> Result<Resolution, ResolveError> {
    let mut write: Option<&ObjectPath> = None;
    let mut notify: Option<&ObjectPath> = None;
    let mut duplicate_write = 0;
    let mut duplicate_notify = 0;

    for (path, entry) in tree
        .descendants(device)
        .filter(|(_, e)| e.has(Capability::GattCharacteristic))
    {
        let Some(uuid) = entry.uuid() else {
            continue;
        };

        if uuid.eq_ignore_ascii_case(write_uuid) {
            debug!("Found write characteristic at {}", path);
            match write {
                None => write = Some(path),
                Some(_) => duplicate_write += 1,
            }
        } else if uuid.eq_ignore_ascii_case(notify_uuid) {
            debug!("Found notify characteristic at {}", path);
            match notify {
                None => notify = Some(path),
                Some(_) => duplicate_notify += 1,
            }
        }
    }

    match (write, notify) {
        (Some(write), Some(notify)) => {
            if duplicate_write > 0 || duplicate_notify > 0 {
                warn!(
                    "Multiple characteristics share a UUID (write: +{}, notify: +{}); using the first reported",
                    duplicate_write, duplicate_notify
                );
            }
            Ok(Resolution {
                characteristics: CharacteristicSet {
                    write: write.clone(),
                    notify: notify.clone(),
                },
                duplicate_write,
                duplicate_notify,
            })
        }
        (Some(_), None) => Err(ResolveError::MissingNotify),
        (None, Some(_)) => Err(ResolveError::MissingWrite),
        (None, None) => Err(ResolveError::MissingBoth),
    }
}
