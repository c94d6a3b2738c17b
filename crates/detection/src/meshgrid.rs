use itertools::Itertools;
use ndarray::{Array1, Array2};

use crate::Result;

/// Generate a pair of coordinate grids from `ys` and `xs`.
///
/// This is like numpy's `meshgrid` with ij-indexing: both grids have shape `(ys.len(), xs.len())`,
/// the first holds the y coordinate of every cell and the second the x coordinate.
/// Flattening either grid in row-major order walks the cells left to right, then top to bottom.
pub fn meshgrid<T>(ys: &Array1<T>, xs: &Array1<T>) -> Result<(Array2<T>, Array2<T>)>
where
    T: Copy,
{
    let shape = (ys.len(), xs.len());
    let (grid_y, grid_x): (Vec<T>, Vec<T>) = ys
        .iter()
        .cartesian_product(xs.iter())
        .map(|(&y, &x)| (y, x))
        .unzip();

    Ok((
        Array2::from_shape_vec(shape, grid_y)?,
        Array2::from_shape_vec(shape, grid_x)?,
    ))
}
