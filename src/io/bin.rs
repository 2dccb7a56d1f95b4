//! Readers for the little-endian "bin" files that accompany a disk index.
//!
//! A bin file is `[u32 rows][u32 cols]` followed by `rows * cols` values in
//! row-major order. The aligned variant pads each row with zeros to the
//! next multiple of 8 columns when materializing in memory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::defaults::round_up;
use crate::error::{AnnError, Result};

/// Read only the `(rows, cols)` header of a bin file.
pub fn bin_metadata(path: impl AsRef<Path>) -> Result<(usize, usize)> {
    let mut f = File::open(path.as_ref())?;
    let rows = f.read_u32::<LittleEndian>()?;
    let cols = f.read_u32::<LittleEndian>()?;
    Ok((rows as usize, cols as usize))
}

fn open_checked(path: &Path) -> Result<(BufReader<File>, usize, usize)> {
    let mut r = BufReader::new(File::open(path)?);
    let rows = r.read_u32::<LittleEndian>()? as usize;
    let cols = r.read_u32::<LittleEndian>()? as usize;
    Ok((r, rows, cols))
}

/// Load a `u8` bin file. Returns `(data, rows, cols)`.
pub fn load_bin_u8(path: impl AsRef<Path>) -> Result<(Vec<u8>, usize, usize)> {
    let (mut r, rows, cols) = open_checked(path.as_ref())?;
    let mut data = vec![0u8; rows * cols];
    r.read_exact(&mut data)?;
    Ok((data, rows, cols))
}

/// Load a `u32` bin file. Returns `(data, rows, cols)`.
pub fn load_bin_u32(path: impl AsRef<Path>) -> Result<(Vec<u32>, usize, usize)> {
    let (mut r, rows, cols) = open_checked(path.as_ref())?;
    let mut data = vec![0u32; rows * cols];
    r.read_u32_into::<LittleEndian>(&mut data)?;
    Ok((data, rows, cols))
}

/// Load an `f32` bin file. Returns `(data, rows, cols)`.
pub fn load_bin_f32(path: impl AsRef<Path>) -> Result<(Vec<f32>, usize, usize)> {
    let (mut r, rows, cols) = open_checked(path.as_ref())?;
    let mut data = vec![0f32; rows * cols];
    r.read_f32_into::<LittleEndian>(&mut data)?;
    Ok((data, rows, cols))
}

/// Load an `f32` bin file, padding each row to `round_up(cols, 8)`.
/// Returns `(data, rows, cols, aligned_cols)`.
pub fn load_aligned_bin_f32(path: impl AsRef<Path>) -> Result<(Vec<f32>, usize, usize, usize)> {
    let (mut r, rows, cols) = open_checked(path.as_ref())?;
    let aligned = round_up(cols, 8);
    let mut data = vec![0f32; rows * aligned];
    for row in 0..rows {
        r.read_f32_into::<LittleEndian>(&mut data[row * aligned..row * aligned + cols])?;
    }
    Ok((data, rows, cols, aligned))
}

/// Load a generic element bin file as raw bytes plus geometry.
/// Returns `(bytes, rows, cols)` where `bytes.len() == rows * cols * width`.
pub fn load_bin_elems(path: impl AsRef<Path>, width: usize) -> Result<(Vec<u8>, usize, usize)> {
    let (mut r, rows, cols) = open_checked(path.as_ref())?;
    let mut data = vec![0u8; rows * cols * width];
    r.read_exact(&mut data)?;
    Ok((data, rows, cols))
}

/// Require that a file exists, with a descriptive load error otherwise.
pub fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(AnnError::Load(format!(
            "{what} not found at {}",
            path.display()
        )))
    }
}
