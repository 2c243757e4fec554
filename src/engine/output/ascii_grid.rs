// ABOUTME: ESRI ASCII grid reading and writing for auxiliary inputs, outputs, and restart
// ABOUTME: Auxiliary grids must match the master grid's shape; a mismatch is fatal

use std::fs;
use std::path::Path;

use crate::engine::core::error::{Result, TrexError};
use crate::engine::core::grid::{Grid, GridMap};

/// The six-line ESRI ASCII header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridHeader {
    pub ncols: usize,
    pub nrows: usize,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    pub nodata: f64,
}

impl GridHeader {
    pub fn of(grid: &Grid) -> Self {
        Self {
            ncols: grid.cols,
            nrows: grid.rows,
            xllcorner: grid.xll_corner,
            yllcorner: grid.yll_corner,
            cellsize: grid.cell_size,
            nodata: grid.nodata,
        }
    }
}

/// Read an ESRI ASCII grid: header then nrows x ncols values in
/// row-major order, north row first.
pub fn read_grid(path: &Path) -> Result<(GridHeader, GridMap<f64>)> {
    let content = fs::read_to_string(path).map_err(|e| TrexError::io(path, e))?;
    let mut tokens = content.split_whitespace();

    let mut header = GridHeader {
        ncols: 0,
        nrows: 0,
        xllcorner: 0.0,
        yllcorner: 0.0,
        cellsize: 0.0,
        nodata: -9999.0,
    };
    for _ in 0..6 {
        let key = tokens
            .next()
            .ok_or_else(|| format_err(path, "truncated header"))?
            .to_ascii_lowercase();
        let value = tokens
            .next()
            .ok_or_else(|| format_err(path, "header key without value"))?;
        match key.as_str() {
            "ncols" => header.ncols = parse_count(path, value)?,
            "nrows" => header.nrows = parse_count(path, value)?,
            "xllcorner" => header.xllcorner = parse_number(path, value)?,
            "yllcorner" => header.yllcorner = parse_number(path, value)?,
            "cellsize" => header.cellsize = parse_number(path, value)?,
            "nodata_value" => header.nodata = parse_number(path, value)?,
            other => {
                return Err(format_err(path, &format!("unknown header key '{}'", other)));
            }
        }
    }
    if header.ncols == 0 || header.nrows == 0 {
        return Err(format_err(path, "zero-sized grid"));
    }

    let mut map = GridMap::new(header.nrows, header.ncols, header.nodata);
    for r in 0..header.nrows {
        for c in 0..header.ncols {
            let token = tokens.next().ok_or_else(|| {
                format_err(
                    path,
                    &format!("short data section at row {} col {}", r, c),
                )
            })?;
            map.set(r, c, parse_number(path, token)?);
        }
    }
    Ok((header, map))
}

/// Read an auxiliary grid and require that it matches the master grid's
/// rows, cols, cell size, and no-data sentinel.
pub fn read_grid_checked(path: &Path, master: &Grid) -> Result<GridMap<f64>> {
    let (header, map) = read_grid(path)?;
    let close = |a: f64, b: f64| (a - b).abs() <= 1.0e-6 * a.abs().max(1.0);
    if header.nrows != master.rows
        || header.ncols != master.cols
        || !close(header.cellsize, master.cell_size)
        || !close(header.nodata, master.nodata)
    {
        return Err(TrexError::GridMismatch {
            path: path.to_path_buf(),
            found_rows: header.nrows,
            found_cols: header.ncols,
            found_cell_size: header.cellsize,
            rows: master.rows,
            cols: master.cols,
            cell_size: master.cell_size,
        });
    }
    Ok(map)
}

/// Write an ESRI ASCII grid.
pub fn write_grid(path: &Path, header: &GridHeader, map: &GridMap<f64>) -> Result<()> {
    let mut out = String::with_capacity(map.len() * 12 + 160);
    out.push_str(&format!("ncols {}\n", header.ncols));
    out.push_str(&format!("nrows {}\n", header.nrows));
    out.push_str(&format!("xllcorner {}\n", header.xllcorner));
    out.push_str(&format!("yllcorner {}\n", header.yllcorner));
    out.push_str(&format!("cellsize {}\n", header.cellsize));
    out.push_str(&format!("NODATA_value {}\n", header.nodata));
    for r in 0..map.rows() {
        let mut first = true;
        for c in 0..map.cols() {
            if !first {
                out.push(' ');
            }
            first = false;
            // shortest representation that parses back to the same value,
            // so restart grids round-trip exactly
            out.push_str(&format!("{:e}", map.get(r, c)));
        }
        out.push('\n');
    }
    fs::write(path, out).map_err(|e| TrexError::io(path, e))
}

fn format_err(path: &Path, reason: &str) -> TrexError {
    TrexError::GridFormat {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn parse_number(path: &Path, token: &str) -> Result<f64> {
    token
        .parse::<f64>()
        .map_err(|_| format_err(path, &format!("bad numeric token '{}'", token)))
}

fn parse_count(path: &Path, token: &str) -> Result<usize> {
    token
        .parse::<usize>()
        .map_err(|_| format_err(path, &format!("bad count token '{}'", token)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.txt");
        let header = GridHeader {
            ncols: 3,
            nrows: 2,
            xllcorner: 100.0,
            yllcorner: 200.0,
            cellsize: 30.0,
            nodata: -9999.0,
        };
        let map = GridMap::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        write_grid(&path, &header, &map).unwrap();
        let (read_header, read_map) = read_grid(&path).unwrap();
        assert_eq!(read_header, header);
        for r in 0..2 {
            for c in 0..3 {
                assert!((read_map.get(r, c) - map.get(r, c)).abs() < 1.0e-12);
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        let header = GridHeader {
            ncols: 2,
            nrows: 2,
            xllcorner: 0.0,
            yllcorner: 0.0,
            cellsize: 30.0,
            nodata: -9999.0,
        };
        write_grid(&path, &header, &GridMap::new(2, 2, 0.0)).unwrap();
        let master = Grid::uniform(3, 3, 30.0, 0.0);
        assert!(matches!(
            read_grid_checked(&path, &master),
            Err(TrexError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.txt");
        std::fs::write(&path, "ncols 2\nnrows").unwrap();
        assert!(matches!(
            read_grid(&path),
            Err(TrexError::GridFormat { .. })
        ));
    }
}
