use anyhow::{Context, Result};
use mime_guess::MimeGuess;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

pub(crate) fn json_from<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {}", path.display()))
}

pub(crate) fn json_into<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), data)
        .with_context(|| format!("failed to write {}", path.display()))
}

pub(crate) fn is_image(path: &Path) -> bool {
    matches!(MimeGuess::from_path(path).first(), Some(mime) if mime.type_() == "image")
}

/// Image files under `root`, sorted by path.
///
/// Only the direct children are listed unless `recursive` is set.
pub(crate) fn images_walk(root: impl AsRef<Path>, recursive: bool) -> Vec<PathBuf> {
    let walker = walkdir::WalkDir::new(root).min_depth(1).follow_links(true);
    let walker = match recursive {
        true => walker,
        false => walker.max_depth(1),
    };
    let mut res = walker
        .into_iter()
        .filter_map(|res| res.ok())
        .filter(|e| e.file_type().is_file() && is_image(e.path()))
        .map(|e| e.into_path())
        .collect::<Vec<_>>();
    res.sort();
    res
}

/// The direct subdirectories of `root` as `(name, path)`, sorted by name.
pub(crate) fn class_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to read dataset directory {}", root.display()))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_walk_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        for name in ["b.png", "a.jpg", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::write(nested.join("c.jpeg"), b"").unwrap();

        let shallow = images_walk(dir.path(), false);
        assert_eq!(
            shallow,
            vec![dir.path().join("a.jpg"), dir.path().join("b.png")]
        );

        let deep = images_walk(dir.path(), true);
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&nested.join("c.jpeg")));
    }

    #[test]
    fn class_dirs_skip_files_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Pneumonia", "Malaria", ".cache"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("README.md"), b"").unwrap();

        let names = class_dirs(dir.path())
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        assert_eq!(names, ["Malaria", "Pneumonia"]);
    }

    #[test]
    fn class_dirs_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(class_dirs(&dir.path().join("missing")).is_err());
    }
}
