//! Functions for writing partition trees to disk.
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use vtkio::model::*;

use crate::{error::Error, error::Result, partition::tree::PartitionTree};

/// Serde-backed JSON output.
pub trait JSON: serde::Serialize {
    fn write_json<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let writer = BufWriter::new(File::create(filename)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

pub trait VTK {
    fn write_vtk<P: AsRef<Path>>(&self, filename: P) -> Result<()>;
}

impl JSON for PartitionTree {}

impl VTK for PartitionTree {
    /// One voxel per region, with the region index and owning process as cell data.
    /// Regions of an unassigned tree are written with owner -1.
    fn write_vtk<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        // A voxel has 8 points per cell, i.e. 24 floats.
        const POINTS_PER_CELL: usize = 8;

        let nregions = self.number_of_regions();
        let mut cell_points = Vec::<f64>::with_capacity(3 * POINTS_PER_CELL * nregions);
        let mut region_ids = Vec::<i32>::with_capacity(nregions);
        let mut owners = Vec::<i32>::with_capacity(nregions);

        for region in 0..nregions {
            let bounds = self.region_bounds(region)?;
            for corner in bounds.corners() {
                cell_points.extend(corner);
            }
            region_ids.push(region as i32);
            owners.push(
                self.process_assigned_to_region(region)
                    .map_or(-1, |owner| owner as i32),
            );
        }

        let npoints = (POINTS_PER_CELL * nregions) as u64;
        let connectivity = Vec::<u64>::from_iter(0..npoints);
        let offsets = Vec::<u64>::from_iter((0..nregions as u64).map(|cell| 8 * cell + 8));

        let scalars = |name: &str, data: Vec<i32>| {
            Attribute::DataArray(DataArrayBase {
                name: String::from(name),
                elem: ElementType::Scalars {
                    num_comp: 1,
                    lookup_table: None,
                },
                data: IOBuffer::I32(data),
            })
        };

        let path = filename.as_ref().to_path_buf();
        let model = Vtk {
            version: Version { major: 1, minor: 0 },
            title: String::from("partition tree regions"),
            byte_order: ByteOrder::BigEndian,
            file_path: Some(path.clone()),
            data: DataSet::inline(UnstructuredGridPiece {
                points: IOBuffer::F64(cell_points),
                cells: Cells {
                    cell_verts: VertexNumbers::XML {
                        connectivity,
                        offsets,
                    },
                    types: vec![CellType::Voxel; nregions],
                },
                data: Attributes {
                    point: vec![],
                    cell: vec![scalars("region", region_ids), scalars("owner", owners)],
                },
            }),
        };

        model
            .export_ascii(&path)
            .map_err(|e| Error::Export(e.to_string()))
    }
}
