use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;


/// Result paths archived when the caller did not ask for specific outputs.
pub const DEFAULT_OUTPUTS: &[&str] = &[
    "odm_orthophoto/odm_orthophoto.tif",
    "odm_orthophoto/odm_orthophoto.tfw",
    "odm_orthophoto/odm_orthophoto.png",
    "odm_orthophoto/odm_orthophoto.wld",
    "odm_orthophoto/odm_orthophoto.mbtiles",
    "odm_orthophoto/odm_orthophoto.kmz",
    "odm_orthophoto/odm_orthophoto_extent.dxf",
    "odm_orthophoto/cutline.gpkg",
    "odm_georeferencing",
    "odm_texturing",
    "odm_dem/dsm.tif",
    "odm_dem/dtm.tif",
    "dsm_tiles",
    "dtm_tiles",
    "orthophoto_tiles",
    "potree_pointcloud",
    "entwine_pointcloud",
    "3d_tiles",
    "images.json",
    "cameras.json",
    "task_output.txt",
    "log.json",
    "odm_report",
];


fn is_pattern(path: &str) -> bool {
    path.contains(['*', '?', '['])
}


/// Expands glob patterns against `root` and drops entries that do not
/// exist. Returned paths are relative to `root`.
pub fn expand_selection(root: &Path, selection: &[String]) -> Result<Vec<String>> {
    let mut expanded = Vec::new();
    for entry in selection {
        if is_pattern(entry) {
            let pattern = format!(
                "{}/{}",
                glob::Pattern::escape(&root.to_string_lossy()),
                entry
            );
            for path in glob::glob(&pattern)?.flatten() {
                if let Ok(relative) = path.strip_prefix(root) {
                    push_unique(&mut expanded, relative_name(relative));
                }
            }
        } else if root.join(entry).exists() {
            push_unique(&mut expanded, entry.clone());
        }
    }
    Ok(expanded)
}


fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}


/// Archive member name for a path relative to the archive root.
pub fn relative_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}


/// Writes `paths` (files or directories, relative to `root`) into a zip
/// file at `destination`. Blocking; call from `spawn_blocking`.
pub fn compress(root: &Path, paths: &[String], destination: &Path) -> Result<()> {
    let file = File::create(destination)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for path in paths {
        let full = root.join(path);
        for entry in WalkDir::new(&full).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() || entry.path() == destination {
                continue;
            }
            let name = match entry.path().strip_prefix(root) {
                Ok(relative) => relative_name(relative),
                Err(_) => continue,
            };
            zip.start_file(name, options)?;
            let mut source = File::open(entry.path())?;
            io::copy(&mut source, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}


pub async fn compress_async(
    root: PathBuf,
    paths: Vec<String>,
    destination: PathBuf,
) -> Result<()> {
    tokio::task::spawn_blocking(move || compress(&root, &paths, &destination)).await?
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("odm_dem")).unwrap();
        std::fs::create_dir_all(root.join("odm_texturing/sub")).unwrap();
        std::fs::write(root.join("odm_dem/dsm.tif"), b"dsm").unwrap();
        std::fs::write(root.join("odm_dem/dtm.tif"), b"dtm").unwrap();
        std::fs::write(root.join("odm_texturing/model.obj"), b"obj").unwrap();
        std::fs::write(root.join("odm_texturing/sub/tex.png"), b"png").unwrap();
        std::fs::write(root.join("task_output.txt"), b"log").unwrap();
        dir
    }

    #[test]
    fn selection_expands_globs_and_skips_missing() {
        let dir = project();
        let selection = vec![
            "odm_dem/*.tif".to_string(),
            "missing.laz".to_string(),
            "task_output.txt".to_string(),
            "odm_dem/dsm.tif".to_string(),
        ];
        let expanded = expand_selection(dir.path(), &selection).unwrap();
        assert_eq!(
            expanded,
            vec!["odm_dem/dsm.tif", "odm_dem/dtm.tif", "task_output.txt"]
        );
    }

    #[test]
    fn archive_contains_files_and_directory_contents() {
        let dir = project();
        let destination = dir.path().join("all.zip");
        let paths = vec!["odm_texturing".to_string(), "task_output.txt".to_string()];
        compress(dir.path(), &paths, &destination).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&destination).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "odm_texturing/model.obj",
                "odm_texturing/sub/tex.png",
                "task_output.txt",
            ]
        );

        let mut contents = String::new();
        archive
            .by_name("task_output.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "log");
    }
}
