use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use zip::ZipArchive;

use crate::error::RegistryError;

pub fn open_package(path: &Path) -> Result<ZipArchive<fs::File>, RegistryError> {
    let file = fs::File::open(path)
        .map_err(|err| RegistryError::Package(format!("open {}: {err}", path.display())))?;
    ZipArchive::new(file)
        .map_err(|err| RegistryError::Package(format!("{}: {err}", path.display())))
}

pub fn read_zip_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, RegistryError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|err| RegistryError::Package(format!("read {name}: {err}")))?;
            Ok(Some(bytes))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(RegistryError::Package(format!("read {name}: {err}"))),
    }
}

pub fn require_zip_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, RegistryError> {
    read_zip_entry(archive, name)?.ok_or_else(|| RegistryError::MissingPart(name.to_string()))
}

/// Temp file next to `dest`, so the final rename never crosses filesystems.
pub fn sibling_tempfile(dest: &Path) -> Result<NamedTempFile, RegistryError> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    tempfile::Builder::new()
        .prefix(".srcreg-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|err| RegistryError::Filesystem(err.to_string()))
}

pub fn persist(temp: NamedTempFile, dest: &Path) -> Result<(), RegistryError> {
    temp.persist(dest)
        .map_err(|err| RegistryError::Filesystem(format!("replace {}: {err}", dest.display())))?;
    Ok(())
}

pub fn write_bytes_atomic(dest: &Path, content: &[u8]) -> Result<(), RegistryError> {
    let mut temp = sibling_tempfile(dest)?;
    temp.write_all(content)
        .and_then(|_| temp.flush())
        .map_err(|err| RegistryError::Filesystem(err.to_string()))?;
    persist(temp, dest)
}
