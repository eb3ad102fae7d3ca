//! What the in-instance agent does with a verified payload.

use crate::artifact::Artifact;
use crate::injectable::{Direction, EntryPoint, Injectable, SerializedPayload};
use crate::package::{Package, PackageSpec};
use crate::InjectError;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A payload as the agent receives it, before it knows the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Injected {
    Package(Package),
    Artifact(Artifact),
}

impl Injected {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Package(p) => p.kind(),
            Self::Artifact(Artifact::File(_)) => "file",
            Self::Artifact(Artifact::Directory(_)) => "directory",
        }
    }
}

impl Injectable for Injected {
    fn entry_point(&self, direction: Direction) -> EntryPoint {
        match self {
            Self::Package(p) => p.entry_point(direction),
            Self::Artifact(a) => a.entry_point(direction),
        }
    }
}

/// Verify `encoded` against `checksum`, rebuild it and run `entry`.
///
/// `load` returns the loaded artifact re-serialized for the host to read back
/// from stdout; the other entry points return `None`.
pub fn dispatch(
    entry: EntryPoint,
    checksum: &str,
    encoded: &str,
) -> Result<Option<SerializedPayload>, InjectError> {
    let injected = Injected::deserialize_payload(checksum, encoded)?;
    info!("agent {entry} for {} payload", injected.kind());
    match (entry, injected) {
        (EntryPoint::Install, Injected::Package(package)) => {
            package.setup()?;
            package.install()?;
            Ok(None)
        }
        (EntryPoint::Dump, Injected::Artifact(artifact)) => {
            artifact.dump()?;
            Ok(None)
        }
        (EntryPoint::Load, Injected::Artifact(mut artifact)) => {
            artifact.load()?;
            let mut payload = artifact.serialize_payload(Direction::Pull)?;
            payload.bootstrap.clear();
            Ok(Some(payload))
        }
        (entry, injected) => Err(InjectError::UnsupportedEntryPoint {
            kind: injected.kind(),
            entry,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Directory, File};
    use std::fs;

    #[test]
    fn dump_writes_pushed_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"pushed").unwrap();
        let mut artifact = Artifact::from(File::new(&src, dir.path().join("dest.txt"), false));
        artifact.load().unwrap();
        let payload = artifact.serialize_payload(Direction::Push).unwrap();

        assert!(dispatch(EntryPoint::Dump, &payload.checksum, &payload.encoded)
            .unwrap()
            .is_none());
        assert_eq!(fs::read(dir.path().join("dest.txt")).unwrap(), b"pushed");
    }

    #[test]
    fn load_returns_payload_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        fs::create_dir_all(&remote).unwrap();
        fs::write(remote.join("log.txt"), b"results").unwrap();

        let request = Artifact::from(Directory::new(&remote, dir.path().join("local"), false));
        let payload = request.serialize_payload(Direction::Pull).unwrap();
        assert!(payload.bootstrap.contains("agent load"));

        let reply = dispatch(EntryPoint::Load, &payload.checksum, &payload.encoded)
            .unwrap()
            .unwrap();
        assert!(reply.bootstrap.is_empty());

        let pulled = Artifact::deserialize_payload(&reply.checksum, &reply.encoded).unwrap();
        pulled.dump().unwrap();
        assert_eq!(fs::read(dir.path().join("local/log.txt")).unwrap(), b"results");
    }

    #[test]
    fn mismatched_entry_point_is_rejected() {
        let artifact = Artifact::from(File::new("a", "b", false));
        let payload = artifact.serialize_payload(Direction::Push).unwrap();
        let err = dispatch(EntryPoint::Install, &payload.checksum, &payload.encoded).unwrap_err();
        assert!(matches!(
            err,
            InjectError::UnsupportedEntryPoint { kind: "file", entry: EntryPoint::Install }
        ));
    }

    #[test]
    fn tampered_payload_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, b"x").unwrap();
        let dest = dir.path().join("dest.txt");
        let mut artifact = Artifact::from(File::new(&src, &dest, false));
        artifact.load().unwrap();
        let payload = artifact.serialize_payload(Direction::Push).unwrap();

        let err = dispatch(EntryPoint::Dump, "00", &payload.encoded).unwrap_err();
        assert!(matches!(err, InjectError::Integrity { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn untagged_dispatches_by_kind() {
        let json = r#"{"kind":"system","packages":["git"]}"#;
        assert_eq!(serde_json::from_str::<Injected>(json).unwrap().kind(), "system");
        let json = r#"{"kind":"directory","src":"a","dest":"b"}"#;
        assert_eq!(serde_json::from_str::<Injected>(json).unwrap().kind(), "directory");
    }
}
