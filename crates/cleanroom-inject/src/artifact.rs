use crate::injectable::{Direction, EntryPoint, Injectable};
use crate::InjectError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A single file travelling between host and instance.
///
/// `src` is read by [`File::load`] on whichever side holds the file, `dest` is
/// written by [`File::dump`] on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub src: PathBuf,
    pub dest: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
}

impl File {
    pub fn new(src: impl Into<PathBuf>, dest: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            overwrite,
            data: None,
            mode: None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn load(&mut self) -> Result<(), InjectError> {
        let meta = fs::metadata(&self.src)
            .map_err(|_| InjectError::SourceNotFound(self.src.clone()))?;
        if meta.is_dir() {
            return Err(InjectError::WrongKind {
                path: self.src.clone(),
                found: "directory",
                expected: "Directory",
            });
        }
        self.data = Some(fs::read(&self.src)?);
        self.mode = Some(meta.permissions().mode() & 0o7777);
        debug!("loaded {}", self.src.display());
        Ok(())
    }

    pub fn dump(&self) -> Result<(), InjectError> {
        if self.dest.exists() && !self.overwrite {
            return Err(InjectError::DestinationExists(self.dest.clone()));
        }
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| InjectError::NothingToWrite(self.dest.clone()))?;
        if let Some(parent) = self.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.dest, data)?;
        if let Some(mode) = self.mode {
            fs::set_permissions(&self.dest, fs::Permissions::from_mode(mode))?;
        }
        debug!("wrote {}", self.dest.display());
        Ok(())
    }
}

/// A directory tree, carried as an uncompressed tar archive.
///
/// Entries are stored under the source directory's own name and that leading
/// component is stripped again on dump, so `dest` receives the contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Directory {
    pub src: PathBuf,
    pub dest: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    data: Option<Vec<u8>>,
}

impl Directory {
    pub fn new(src: impl Into<PathBuf>, dest: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            overwrite,
            data: None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn load(&mut self) -> Result<(), InjectError> {
        if !self.src.exists() {
            return Err(InjectError::SourceNotFound(self.src.clone()));
        }
        if !self.src.is_dir() {
            return Err(InjectError::WrongKind {
                path: self.src.clone(),
                found: "file",
                expected: "File",
            });
        }
        let prefix = self
            .src
            .file_name()
            .map_or_else(|| "root".to_owned(), |n| n.to_string_lossy().into_owned());
        self.data = Some(pack_tree(&self.src, &prefix)?);
        debug!("packed {}", self.src.display());
        Ok(())
    }

    /// Unpack into `dest`. An existing empty directory counts as free.
    pub fn dump(&self) -> Result<(), InjectError> {
        if self.dest.exists() && !self.overwrite && !is_empty_dir(&self.dest)? {
            return Err(InjectError::DestinationExists(self.dest.clone()));
        }
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| InjectError::NothingToWrite(self.dest.clone()))?;
        unpack_stripped(data, &self.dest)?;
        debug!("unpacked into {}", self.dest.display());
        Ok(())
    }
}

/// Either kind of artifact, as written in project files and sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Artifact {
    File(File),
    Directory(Directory),
}

impl Artifact {
    pub fn src(&self) -> &Path {
        match self {
            Self::File(f) => &f.src,
            Self::Directory(d) => &d.src,
        }
    }

    pub fn dest(&self) -> &Path {
        match self {
            Self::File(f) => &f.dest,
            Self::Directory(d) => &d.dest,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    pub fn overwrite(&self) -> bool {
        match self {
            Self::File(f) => f.overwrite,
            Self::Directory(d) => d.overwrite,
        }
    }

    /// Whether `other` names the same transfer: kind, paths and overwrite flag.
    pub fn same_transfer(&self, other: &Artifact) -> bool {
        self.is_directory() == other.is_directory()
            && self.src() == other.src()
            && self.dest() == other.dest()
            && self.overwrite() == other.overwrite()
    }

    pub fn load(&mut self) -> Result<(), InjectError> {
        match self {
            Self::File(f) => f.load(),
            Self::Directory(d) => d.load(),
        }
    }

    pub fn dump(&self) -> Result<(), InjectError> {
        match self {
            Self::File(f) => f.dump(),
            Self::Directory(d) => d.dump(),
        }
    }
}

impl Injectable for Artifact {
    fn entry_point(&self, direction: Direction) -> EntryPoint {
        match direction {
            Direction::Push => EntryPoint::Dump,
            Direction::Pull => EntryPoint::Load,
        }
    }
}

impl From<File> for Artifact {
    fn from(f: File) -> Self {
        Self::File(f)
    }
}

impl From<Directory> for Artifact {
    fn from(d: Directory) -> Self {
        Self::Directory(d)
    }
}

fn is_empty_dir(path: &Path) -> Result<bool, InjectError> {
    Ok(path.is_dir() && fs::read_dir(path)?.next().is_none())
}

fn make_header(path: &Path, entry_type: tar::EntryType) -> Result<tar::Header, InjectError> {
    let meta = path.symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode());
    Ok(header)
}

fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, InjectError> {
    let mut result = Vec::new();
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| InjectError::UnsafePath(format!("{}: {e}", full.display())))?
            .to_string_lossy()
            .into_owned();
        if full.symlink_metadata()?.is_dir() {
            result.push((rel, full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}

/// Pack `root` into a deterministic tar with every entry under `prefix/`.
fn pack_tree(root: &Path, prefix: &str) -> Result<Vec<u8>, InjectError> {
    let mut entries = collect_entries(root, root)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);

    let mut top = make_header(root, tar::EntryType::Directory)?;
    top.set_size(0);
    top.set_cksum();
    ar.append_data(&mut top, format!("{prefix}/"), &[] as &[u8])?;

    for (rel, full) in &entries {
        let name = format!("{prefix}/{rel}");
        let ft = full.symlink_metadata()?.file_type();
        if ft.is_file() {
            let data = fs::read(full)?;
            let mut header = make_header(full, tar::EntryType::Regular)?;
            header.set_size(data.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, &name, data.as_slice())?;
        } else if ft.is_dir() {
            let mut header = make_header(full, tar::EntryType::Directory)?;
            header.set_size(0);
            header.set_cksum();
            ar.append_data(&mut header, format!("{name}/"), &[] as &[u8])?;
        } else if ft.is_symlink() {
            let target = fs::read_link(full)?;
            let mut header = make_header(full, tar::EntryType::Symlink)?;
            header.set_size(0);
            header.set_cksum();
            ar.append_link(&mut header, &name, &target)?;
        } else {
            warn!("skipping unsupported file type: {name}");
        }
    }

    Ok(ar.into_inner()?)
}

/// Extract `data` into `dest`, dropping the first path component of every entry.
fn unpack_stripped(data: &[u8], dest: &Path) -> Result<(), InjectError> {
    fs::create_dir_all(dest)?;
    let mut ar = tar::Archive::new(data);
    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut components = path.components();
        components.next();
        let stripped: PathBuf = components.collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(InjectError::UnsafePath(path.display().to_string()));
        }
        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.set_preserve_permissions(true);
        entry.set_preserve_mtime(false);
        entry.set_unpack_xattrs(false);
        entry.unpack(&target)?;
    }
    Ok(())
}
