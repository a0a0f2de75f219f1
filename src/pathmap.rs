//! Translation between virtual paths (arbitrarily long components) and real
//! paths (every component fits the backing filesystem's 255 byte limit).
//!
//! The transform is applied component by component; a component longer than
//! 255 bytes is replaced on disk by the fixed-form surrogate
//! `.LFN.<sha256-hex>` and the original name is registered in the digest
//! database so the reverse projection can recover it.

use crate::namedb::NameDb;
use rusqlite::Result as SqliteResult;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

pub const SURROGATE_PREFIX: &str = ".LFN.";
pub const MAX_COMPONENT_BYTES: usize = 255;
pub const DIGEST_HEX_LENGTH: usize = 64;

/// Virtual → real projection. Registers every oversized component in the
/// digest database as a side effect.
pub fn to_real(db: &NameDb, path: &OsStr) -> SqliteResult<OsString> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for (idx, component) in bytes.split(|b| *b == b'/').enumerate() {
        if idx > 0 {
            out.push(b'/');
        }
        if component.len() > MAX_COMPONENT_BYTES {
            let digest = db.record(component)?;
            out.extend_from_slice(SURROGATE_PREFIX.as_bytes());
            out.extend_from_slice(digest.as_bytes());
        } else {
            out.extend_from_slice(component);
        }
    }
    Ok(OsString::from_vec(out))
}

/// Real → virtual projection. Surrogate components whose digest is unknown
/// are passed through unchanged rather than failing the whole path.
pub fn to_virtual(db: &NameDb, path: &OsStr) -> SqliteResult<OsString> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for (idx, component) in bytes.split(|b| *b == b'/').enumerate() {
        if idx > 0 {
            out.push(b'/');
        }
        match surrogate_digest(component) {
            Some(digest) => match db.resolve(digest)? {
                Some(name) => out.extend_from_slice(&name),
                None => out.extend_from_slice(component),
            },
            None => out.extend_from_slice(component),
        }
    }
    Ok(OsString::from_vec(out))
}

/// The embedded digest of a surrogate-form component, if it is one.
fn surrogate_digest(component: &[u8]) -> Option<&str> {
    let rest = component.strip_prefix(SURROGATE_PREFIX.as_bytes())?;
    std::str::from_utf8(rest).ok()
}

/// Join a real parent path with an already-translated child name.
pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    let mut composed = OsString::from(parent);
    if !parent.as_bytes().ends_with(b"/") {
        composed.push(OsStr::new("/"));
    }
    composed.push(name);
    composed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namedb::digest_hex;

    fn db() -> NameDb {
        NameDb::in_memory().unwrap()
    }

    fn long_name() -> String {
        "x".repeat(300)
    }

    #[test]
    fn short_names_pass_through_unchanged() {
        let db = db();
        let path = OsStr::new("/dir/file.txt");
        assert_eq!(to_real(&db, path).unwrap(), path);
        assert_eq!(to_virtual(&db, path).unwrap(), path);
    }

    #[test]
    fn long_component_becomes_fixed_form_surrogate() {
        let db = db();
        let name = long_name();
        let real = to_real(&db, OsStr::new(&name)).unwrap();
        let real = real.as_bytes();
        assert_eq!(real.len(), SURROGATE_PREFIX.len() + DIGEST_HEX_LENGTH);
        assert!(real.starts_with(SURROGATE_PREFIX.as_bytes()));
        assert_eq!(
            &real[SURROGATE_PREFIX.len()..],
            digest_hex(name.as_bytes()).as_bytes()
        );
    }

    #[test]
    fn round_trip_after_registration() {
        let db = db();
        let path = format!("/dir/{}/leaf", long_name());
        let real = to_real(&db, OsStr::new(&path)).unwrap();
        assert_eq!(to_virtual(&db, &real).unwrap(), OsStr::new(&path));
    }

    #[test]
    fn translation_is_deterministic() {
        let db = db();
        let name = long_name();
        let first = to_real(&db, OsStr::new(&name)).unwrap();
        let second = to_real(&db, OsStr::new(&name)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn trailing_separator_is_preserved() {
        let db = db();
        let path = format!("{}/", long_name());
        let real = to_real(&db, OsStr::new(&path)).unwrap();
        assert!(real.as_bytes().ends_with(b"/"));
        assert_eq!(to_virtual(&db, &real).unwrap(), OsStr::new(&path));
    }

    #[test]
    fn unknown_surrogate_degrades_to_itself() {
        let db = db();
        let orphan = format!(".LFN.{}", "a".repeat(64));
        assert_eq!(
            to_virtual(&db, OsStr::new(&orphan)).unwrap(),
            OsStr::new(&orphan)
        );
    }

    #[test]
    fn child_path_joining() {
        assert_eq!(
            make_child_path(OsStr::new("/srv/data"), OsStr::new("file")),
            OsStr::new("/srv/data/file")
        );
        assert_eq!(
            make_child_path(OsStr::new("/"), OsStr::new("file")),
            OsStr::new("/file")
        );
    }
}
