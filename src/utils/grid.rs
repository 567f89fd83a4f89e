//! Side-by-side sample grids of generated and real images

use image::{Rgb, RgbImage};
use ndarray::{s, Array3, Array4, ArrayView3, Axis};
use std::path::Path;

use crate::error::{PgganError, Result};

/// Grid rows used for the batch sizes of the curriculum
pub fn rows_for(batch_size: usize) -> usize {
    match batch_size {
        32 => 8,
        16 | 8 => 4,
        4 | 2 => 2,
        n => (n as f64).sqrt().ceil().max(1.0) as usize,
    }
}

/// Assemble fakes and reals into an `(H, W, C)` grid scaled to `[0, 1]`
///
/// Each row holds `n_col` fakes followed by `n_col` reals, with
/// `n_col = ceil(batch / n_row)`. The fake half and the real half are
/// min/max normalized independently. Slots past the end of the batch stay
/// at the half's minimum.
pub fn sample_grid(fake: &Array4<f32>, real: &Array4<f32>) -> Result<Array3<f32>> {
    let (n, c, h, w) = fake.dim();
    if real.dim() != fake.dim() {
        return Err(PgganError::Shape(format!(
            "fake batch {:?} and real batch {:?} differ",
            fake.dim(),
            real.dim()
        )));
    }
    if n == 0 {
        return Err(PgganError::Shape("cannot sample an empty batch".to_string()));
    }

    let n_row = rows_for(n);
    let n_col = n.div_ceil(n_row);
    let half_w = n_col * w;

    let fake_half = tile(fake, n_row, n_col)?;
    let real_half = tile(real, n_row, n_col)?;

    let mut grid = Array3::<f32>::zeros((n_row * h, 2 * half_w, c));
    grid.slice_mut(s![.., ..half_w, ..]).assign(&fake_half);
    grid.slice_mut(s![.., half_w.., ..]).assign(&real_half);
    Ok(grid)
}

/// Tile a batch row-major into `(n_row * H, n_col * W, C)`, normalized
fn tile(batch: &Array4<f32>, n_row: usize, n_col: usize) -> Result<Array3<f32>> {
    let (_, c, h, w) = batch.dim();
    let min = batch.iter().copied().fold(f32::INFINITY, f32::min);
    let max = batch.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Err(PgganError::Numeric(format!(
            "sample values span [{}, {}], cannot normalize",
            min, max
        )));
    }

    let mut out = Array3::<f32>::zeros((n_row * h, n_col * w, c));
    for (i, image) in batch.axis_iter(Axis(0)).enumerate() {
        let (row, col) = (i / n_col, i % n_col);
        let hwc: ArrayView3<f32> = image.permuted_axes([1, 2, 0]);
        out.slice_mut(s![row * h..(row + 1) * h, col * w..(col + 1) * w, ..])
            .assign(&hwc.mapv(|v| (v - min) / range));
    }
    Ok(out)
}

/// Encode an `(H, W, C)` grid in `[0, 1]` as an RGB image
pub fn to_rgb(grid: &Array3<f32>) -> Result<RgbImage> {
    let (h, w, c) = grid.dim();
    if c != 1 && c != 3 {
        return Err(PgganError::Shape(format!("cannot encode {} channels as RGB", c)));
    }

    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (y, x) = (y as usize, x as usize);
        if c == 1 {
            let v = to_u8(grid[[y, x, 0]]);
            Rgb([v, v, v])
        } else {
            Rgb([to_u8(grid[[y, x, 0]]), to_u8(grid[[y, x, 1]]), to_u8(grid[[y, x, 2]])])
        }
    }))
}

/// Build the grid and write it as PNG
pub fn save_sample_grid(fake: &Array4<f32>, real: &Array4<f32>, path: impl AsRef<Path>) -> Result<()> {
    let grid = sample_grid(fake, real)?;
    to_rgb(&grid)?.save(path.as_ref())?;
    Ok(())
}
