//! Micrograph conversion: raw `.tif` images to reviewable JPEGs, in place.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::analysis::error::AnalysisError;

/// Convert every `.tif` in the folder to a sibling `<name>.tif.jpg`.
/// Already-converted images are left alone; per-file failures are logged
/// and do not abort the pass. Returns the newly written JPEG paths.
pub fn convert_all(folder: &Path) -> Result<Vec<PathBuf>, AnalysisError> {
    let mut tifs: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "tif").unwrap_or(false))
        .collect();
    tifs.sort();

    let mut converted = Vec::new();
    for tif in tifs {
        let target = jpg_sibling(&tif);
        if target.exists() {
            continue;
        }
        match convert_one(&tif, &target) {
            Ok(()) => {
                info!("converted [{}]", target.display());
                converted.push(target);
            }
            Err(e) => warn!("could not convert {}: {e}", tif.display()),
        }
    }
    Ok(converted)
}

/// `photo.tif` -> `photo.tif.jpg` (full source name kept in the target).
fn jpg_sibling(tif: &Path) -> PathBuf {
    let mut name = tif
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".jpg");
    tif.with_file_name(name)
}

fn convert_one(source: &Path, target: &Path) -> Result<(), AnalysisError> {
    let decoded = image::open(source)?;
    decoded
        .to_rgb8()
        .save_with_format(target, image::ImageFormat::Jpeg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_tifs_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let tif = dir.path().join("slice.tif");
        image::RgbImage::new(8, 8)
            .save_with_format(&tif, image::ImageFormat::Tiff)
            .unwrap();
        let converted = convert_all(dir.path()).unwrap();
        assert_eq!(converted, vec![dir.path().join("slice.tif.jpg")]);
        assert!(converted[0].exists());
        // second pass converts nothing new
        assert!(convert_all(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn unreadable_tif_is_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.tif"), b"not a tif").unwrap();
        let converted = convert_all(dir.path()).unwrap();
        assert!(converted.is_empty());
    }
}
