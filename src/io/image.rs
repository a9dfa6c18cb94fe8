//! PNG import and export of sections

use crate::io::error::{AlignError, Result, fs_error, invalid_parameter};
use crate::spatial::bbox::BoundingBox;
use crate::store::tensor_store::{LayerHandle, TensorStore};
use crate::store::volumes::{read_image, write_plane};
use image::{GrayImage, Luma};
use ndarray::{Array2, ArrayView2};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load a PNG as a grayscale plane of raw `0..=255` values
///
/// Colour images are converted to 8-bit luma.
///
/// # Errors
///
/// Returns [`AlignError::ImageLoad`] if the file cannot be decoded
pub fn read_png(path: &Path) -> Result<Array2<f32>> {
    let image = image::open(path)
        .map_err(|source| AlignError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?
        .to_luma8();
    let (width, height) = image.dimensions();
    Ok(Array2::from_shape_fn((height as usize, width as usize), |(r, c)| {
        f32::from(image.get_pixel(c as u32, r as u32).0[0])
    }))
}

/// Save a plane as an 8-bit grayscale PNG, rounding and clamping values
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created or the image
/// cannot be written
pub fn write_png(path: &Path, plane: &ArrayView2<'_, f32>) -> Result<()> {
    let (rows, cols) = plane.dim();
    let mut image = GrayImage::new(cols as u32, rows as u32);
    for ((r, c), value) in plane.indexed_iter() {
        image.put_pixel(c as u32, r as u32, Luma([value.round().clamp(0.0, 255.0) as u8]));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| fs_error(parent, "create directory", e))?;
    }
    image.save(path).map_err(|source| AlignError::ImageExport {
        path: path.to_path_buf(),
        source,
    })
}

/// Sorted PNG files of a directory
///
/// # Errors
///
/// Returns a file system error if the directory cannot be listed
pub fn png_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| fs_error(dir, "list sections", e))?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("png"))
        .collect();
    files.sort();
    Ok(files)
}

/// Sections written by an import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    /// Section indices written, in file order
    pub sections: Vec<i64>,
    /// Union of every imported section's extent at mip 0
    pub bbox: BoundingBox,
}

/// Write every PNG of `dir`, in name order, as consecutive sections of
/// `layer` starting at `z_start`
///
/// Each image is placed at the origin at mip 0.
///
/// # Errors
///
/// Returns an error if the directory holds no PNG, a file cannot be decoded,
/// or a write fails
pub fn import_sections(
    store: &dyn TensorStore,
    layer: &LayerHandle,
    dir: &Path,
    z_start: i64,
) -> Result<ImportSummary> {
    let files = png_files(dir)?;
    if files.is_empty() {
        return Err(invalid_parameter(
            "dir",
            &dir.display(),
            &"no PNG sections found",
        ));
    }
    store.create_layer(layer)?;
    let mut sections = Vec::with_capacity(files.len());
    let mut extent = [0_i64; 2];
    for (z, path) in (z_start..).zip(&files) {
        let plane = read_png(path)?;
        let (rows, cols) = plane.dim();
        let bbox = BoundingBox::new(0..cols as i64, 0..rows as i64);
        write_plane(store, layer, 0, &bbox, z, &plane.view())?;
        debug!(z, path = %path.display(), cols, rows, "section imported");
        extent = [extent[0].max(cols as i64), extent[1].max(rows as i64)];
        sections.push(z);
    }
    info!(sections = sections.len(), layer = %layer.path, "import finished");
    Ok(ImportSummary {
        sections,
        bbox: BoundingBox::new(0..extent[0], 0..extent[1]),
    })
}

/// Write one section of an image layer at `mip` to a PNG
///
/// # Errors
///
/// Returns an error if the read fails or the image cannot be written
pub fn export_section(
    store: &dyn TensorStore,
    layer: &LayerHandle,
    z: i64,
    mip: u32,
    bbox: &BoundingBox,
    path: &Path,
) -> Result<()> {
    let plane = read_image(store, layer, mip, bbox, z)?;
    write_png(path, &plane.view())?;
    info!(z, mip, path = %path.display(), "section exported");
    Ok(())
}
