//! The closed set of dataset kinds that can be partitioned, moved and merged.
//!
//! Merging is append: points and cells of later pieces follow those of earlier pieces,
//! with connectivity shifted accordingly. Image grids are the exception, their pieces are
//! placed by extent into the union of all extents.
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::bounds::Bounds,
};

/// Cartesian coordinate (x, y, z).
pub type Coordinate = [f64; 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    PointCloud,
    UnstructuredMesh,
    ImageGrid,
    Graph,
}

/// Points, each of which is also a vertex cell.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Coordinate>,
    /// One value per point, or empty.
    pub scalars: Vec<f64>,
    /// Ghost flag per point, or empty when there are no ghosts.
    pub ghost: Vec<bool>,
}

/// Cells given by connectivity into a shared point list. `offsets[i]` is the end of cell
/// `i` in `connectivity`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnstructuredMesh {
    pub points: Vec<Coordinate>,
    pub connectivity: Vec<u64>,
    pub offsets: Vec<u64>,
    pub cell_types: Vec<u8>,
    pub ghost: Vec<bool>,
}

/// Regular grid of point samples. The geometry is not part of the serialized payload, the
/// marshaller carries it in the block header instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageGrid {
    #[serde(skip, default = "ImageGrid::empty_extent")]
    pub extent: [i64; 6],
    #[serde(skip)]
    pub origin: Coordinate,
    #[serde(skip, default = "ImageGrid::unit_spacing")]
    pub spacing: Coordinate,
    /// One value per point, x fastest.
    pub scalars: Vec<f64>,
}

/// Vertices with positions and undirected edges. Edges play the role of cells.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub vertices: Vec<Coordinate>,
    pub edges: Vec<[u64; 2]>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Dataset {
    PointCloud(PointCloud),
    UnstructuredMesh(UnstructuredMesh),
    ImageGrid(ImageGrid),
    Graph(Graph),
}

impl Default for Dataset {
    fn default() -> Self {
        Dataset::PointCloud(PointCloud::default())
    }
}

impl Default for ImageGrid {
    fn default() -> Self {
        ImageGrid {
            extent: ImageGrid::empty_extent(),
            origin: [0.; 3],
            spacing: ImageGrid::unit_spacing(),
            scalars: Vec::new(),
        }
    }
}

fn append_flags(dst: &mut Vec<bool>, dst_len: usize, src: &[bool], src_len: usize) {
    if dst.is_empty() && src.is_empty() {
        return;
    }
    dst.resize(dst_len, false);
    if src.is_empty() {
        dst.resize(dst_len + src_len, false);
    } else {
        dst.extend_from_slice(src);
    }
}

fn bounds_of<'a>(points: impl Iterator<Item = &'a Coordinate>) -> Bounds {
    let mut bounds = Bounds::empty();
    for point in points {
        bounds.add_point(point);
    }
    bounds
}

fn centroid<'a>(points: impl Iterator<Item = &'a Coordinate>) -> Coordinate {
    let mut sum = [0.; 3];
    let mut count = 0.;
    for point in points {
        for dim in 0..3 {
            sum[dim] += point[dim];
        }
        count += 1.;
    }
    if count > 0. {
        [sum[0] / count, sum[1] / count, sum[2] / count]
    } else {
        sum
    }
}

impl UnstructuredMesh {
    fn cell(&self, i: usize) -> &[u64] {
        let start = if i == 0 { 0 } else { self.offsets[i - 1] as usize };
        &self.connectivity[start..self.offsets[i] as usize]
    }

    fn cell_points(&self, i: usize) -> impl Iterator<Item = &Coordinate> {
        self.cell(i).iter().map(move |&p| &self.points[p as usize])
    }
}

impl ImageGrid {
    fn empty_extent() -> [i64; 6] {
        [0, -1, 0, -1, 0, -1]
    }

    fn unit_spacing() -> Coordinate {
        [1.; 3]
    }

    pub fn new(extent: [i64; 6], origin: Coordinate, spacing: Coordinate, scalars: Vec<f64>) -> Self {
        ImageGrid {
            extent,
            origin,
            spacing,
            scalars,
        }
    }

    /// Points per axis; zero everywhere for an empty extent.
    pub fn dimensions(&self) -> [usize; 3] {
        let e = self.extent;
        if (0..3).any(|d| e[2 * d + 1] < e[2 * d]) {
            return [0; 3];
        }
        [
            (e[1] - e[0] + 1) as usize,
            (e[3] - e[2] + 1) as usize,
            (e[5] - e[4] + 1) as usize,
        ]
    }

    /// Cells per axis; an axis with a single point layer counts one cell layer.
    fn cell_dimensions(&self) -> [usize; 3] {
        let dims = self.dimensions();
        if dims.iter().any(|&d| d == 0) {
            return [0; 3];
        }
        [
            dims[0].saturating_sub(1).max(1),
            dims[1].saturating_sub(1).max(1),
            dims[2].saturating_sub(1).max(1),
        ]
    }

    fn cell_ijk(&self, i: usize) -> [usize; 3] {
        let cd = self.cell_dimensions();
        [i % cd[0], (i / cd[0]) % cd[1], i / (cd[0] * cd[1])]
    }

    fn cell_bounds(&self, i: usize) -> Bounds {
        let ijk = self.cell_ijk(i);
        let dims = self.dimensions();
        let mut bounds = Bounds::empty();
        for dim in 0..3 {
            let lo = self.extent[2 * dim] + ijk[dim] as i64;
            let hi = if dims[dim] > 1 { lo + 1 } else { lo };
            bounds.min[dim] = self.origin[dim] + self.spacing[dim] * lo as f64;
            bounds.max[dim] = self.origin[dim] + self.spacing[dim] * hi as f64;
        }
        bounds
    }

    fn union_extent(a: &[i64; 6], b: &[i64; 6]) -> [i64; 6] {
        let mut e = *a;
        for d in 0..3 {
            e[2 * d] = e[2 * d].min(b[2 * d]);
            e[2 * d + 1] = e[2 * d + 1].max(b[2 * d + 1]);
        }
        e
    }

    /// Place the pieces into one grid spanning the union of their extents.
    fn merge(pieces: Vec<ImageGrid>) -> ImageGrid {
        let pieces: Vec<ImageGrid> = pieces
            .into_iter()
            .filter(|p| p.dimensions()[0] > 0)
            .collect();
        let Some(first) = pieces.first() else {
            return ImageGrid::default();
        };

        let extent = pieces
            .iter()
            .skip(1)
            .fold(first.extent, |acc, p| ImageGrid::union_extent(&acc, &p.extent));
        let mut merged = ImageGrid::new(extent, first.origin, first.spacing, Vec::new());
        let dims = merged.dimensions();
        merged.scalars = vec![0.; dims[0] * dims[1] * dims[2]];

        for piece in pieces.iter() {
            let pd = piece.dimensions();
            if piece.scalars.len() < pd[0] * pd[1] * pd[2] {
                continue;
            }
            for k in 0..pd[2] {
                for j in 0..pd[1] {
                    for i in 0..pd[0] {
                        let gi = (piece.extent[0] - extent[0]) as usize + i;
                        let gj = (piece.extent[2] - extent[2]) as usize + j;
                        let gk = (piece.extent[4] - extent[4]) as usize + k;
                        merged.scalars[gi + dims[0] * (gj + dims[1] * gk)] =
                            piece.scalars[i + pd[0] * (j + pd[1] * k)];
                    }
                }
            }
        }
        merged
    }
}

impl Dataset {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Dataset::PointCloud(_) => DatasetKind::PointCloud,
            Dataset::UnstructuredMesh(_) => DatasetKind::UnstructuredMesh,
            Dataset::ImageGrid(_) => DatasetKind::ImageGrid,
            Dataset::Graph(_) => DatasetKind::Graph,
        }
    }

    /// An empty dataset of `kind`.
    pub fn empty(kind: DatasetKind) -> Dataset {
        match kind {
            DatasetKind::PointCloud => Dataset::PointCloud(PointCloud::default()),
            DatasetKind::UnstructuredMesh => Dataset::UnstructuredMesh(UnstructuredMesh::default()),
            DatasetKind::ImageGrid => Dataset::ImageGrid(ImageGrid::default()),
            DatasetKind::Graph => Dataset::Graph(Graph::default()),
        }
    }

    pub fn empty_like(&self) -> Dataset {
        Dataset::empty(self.kind())
    }

    pub fn number_of_points(&self) -> usize {
        match self {
            Dataset::PointCloud(cloud) => cloud.points.len(),
            Dataset::UnstructuredMesh(mesh) => mesh.points.len(),
            Dataset::ImageGrid(image) => image.dimensions().iter().product(),
            Dataset::Graph(graph) => graph.vertices.len(),
        }
    }

    pub fn number_of_cells(&self) -> usize {
        match self {
            Dataset::PointCloud(cloud) => cloud.points.len(),
            Dataset::UnstructuredMesh(mesh) => mesh.offsets.len(),
            Dataset::ImageGrid(image) => image.cell_dimensions().iter().product(),
            Dataset::Graph(graph) => graph.edges.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.number_of_points() == 0 && self.number_of_cells() == 0
    }

    /// Ghost flag per cell, when the dataset carries any.
    pub fn cell_ghost_flags(&self) -> Option<&[bool]> {
        let flags = match self {
            Dataset::PointCloud(cloud) => &cloud.ghost,
            Dataset::UnstructuredMesh(mesh) => &mesh.ghost,
            _ => return None,
        };
        (!flags.is_empty()).then_some(flags.as_slice())
    }

    /// One representative point per cell: the cell centroid.
    pub fn cell_centers(&self) -> Vec<Coordinate> {
        match self {
            Dataset::PointCloud(cloud) => cloud.points.clone(),
            Dataset::UnstructuredMesh(mesh) => (0..mesh.offsets.len())
                .map(|i| centroid(mesh.cell_points(i)))
                .collect(),
            Dataset::ImageGrid(image) => (0..self.number_of_cells())
                .map(|i| image.cell_bounds(i).center())
                .collect(),
            Dataset::Graph(graph) => graph
                .edges
                .iter()
                .map(|e| {
                    centroid(
                        [&graph.vertices[e[0] as usize], &graph.vertices[e[1] as usize]]
                            .into_iter(),
                    )
                })
                .collect(),
        }
    }

    pub fn cell_bounds(&self, i: usize) -> Bounds {
        match self {
            Dataset::PointCloud(cloud) => Bounds::from_points(&cloud.points[i..=i]),
            Dataset::UnstructuredMesh(mesh) => bounds_of(mesh.cell_points(i)),
            Dataset::ImageGrid(image) => image.cell_bounds(i),
            Dataset::Graph(graph) => {
                let e = graph.edges[i];
                bounds_of(
                    [&graph.vertices[e[0] as usize], &graph.vertices[e[1] as usize]].into_iter(),
                )
            }
        }
    }

    pub fn bounds(&self) -> Bounds {
        match self {
            Dataset::PointCloud(cloud) => Bounds::from_points(&cloud.points),
            Dataset::UnstructuredMesh(mesh) => Bounds::from_points(&mesh.points),
            Dataset::Graph(graph) => Bounds::from_points(&graph.vertices),
            Dataset::ImageGrid(_) => (0..self.number_of_cells())
                .map(|i| self.cell_bounds(i))
                .fold(Bounds::empty(), |acc, b| acc.union(&b)),
        }
    }

    /// The subset made of cells `ids`, keeping only the points they use.
    ///
    /// Image grids are structured and cannot be cut per cell; they are returned whole when
    /// any cell is requested.
    pub fn extract_cells(&self, ids: &[usize]) -> Dataset {
        match self {
            Dataset::PointCloud(cloud) => Dataset::PointCloud(PointCloud {
                points: ids.iter().map(|&i| cloud.points[i]).collect(),
                scalars: if cloud.scalars.is_empty() {
                    Vec::new()
                } else {
                    ids.iter().map(|&i| cloud.scalars[i]).collect()
                },
                ghost: if cloud.ghost.is_empty() {
                    Vec::new()
                } else {
                    ids.iter().map(|&i| cloud.ghost[i]).collect()
                },
            }),
            Dataset::UnstructuredMesh(mesh) => {
                let mut remap = vec![u64::MAX; mesh.points.len()];
                let mut subset = UnstructuredMesh::default();
                for &i in ids {
                    for &p in mesh.cell(i) {
                        if remap[p as usize] == u64::MAX {
                            remap[p as usize] = subset.points.len() as u64;
                            subset.points.push(mesh.points[p as usize]);
                        }
                        subset.connectivity.push(remap[p as usize]);
                    }
                    subset.offsets.push(subset.connectivity.len() as u64);
                    subset.cell_types.push(mesh.cell_types.get(i).copied().unwrap_or_default());
                    if !mesh.ghost.is_empty() {
                        subset.ghost.push(mesh.ghost[i]);
                    }
                }
                Dataset::UnstructuredMesh(subset)
            }
            Dataset::ImageGrid(_) if ids.is_empty() => self.empty_like(),
            Dataset::ImageGrid(_) => self.clone(),
            Dataset::Graph(graph) => {
                let mut remap = vec![u64::MAX; graph.vertices.len()];
                let mut subset = Graph::default();
                for &i in ids {
                    let mut edge = graph.edges[i];
                    for end in edge.iter_mut() {
                        let v = *end as usize;
                        if remap[v] == u64::MAX {
                            remap[v] = subset.vertices.len() as u64;
                            subset.vertices.push(graph.vertices[v]);
                        }
                        *end = remap[v];
                    }
                    subset.edges.push(edge);
                }
                Dataset::Graph(subset)
            }
        }
    }

    /// Append `other` after this dataset's points and cells.
    pub fn append(&mut self, other: &Dataset) -> Result<()> {
        match (self, other) {
            (Dataset::PointCloud(a), Dataset::PointCloud(b)) => {
                let (na, nb) = (a.points.len(), b.points.len());
                if !(a.scalars.is_empty() && b.scalars.is_empty()) {
                    a.scalars.resize(na, 0.);
                    if b.scalars.is_empty() {
                        a.scalars.resize(na + nb, 0.);
                    } else {
                        a.scalars.extend_from_slice(&b.scalars);
                    }
                }
                append_flags(&mut a.ghost, na, &b.ghost, nb);
                a.points.extend_from_slice(&b.points);
            }
            (Dataset::UnstructuredMesh(a), Dataset::UnstructuredMesh(b)) => {
                let point_shift = a.points.len() as u64;
                let connectivity_shift = a.connectivity.len() as u64;
                append_flags(&mut a.ghost, a.offsets.len(), &b.ghost, b.offsets.len());
                a.points.extend_from_slice(&b.points);
                a.connectivity
                    .extend(b.connectivity.iter().map(|p| p + point_shift));
                a.offsets
                    .extend(b.offsets.iter().map(|o| o + connectivity_shift));
                a.cell_types.extend_from_slice(&b.cell_types);
            }
            (Dataset::Graph(a), Dataset::Graph(b)) => {
                let shift = a.vertices.len() as u64;
                a.vertices.extend_from_slice(&b.vertices);
                a.edges
                    .extend(b.edges.iter().map(|e| [e[0] + shift, e[1] + shift]));
            }
            (Dataset::ImageGrid(a), Dataset::ImageGrid(b)) => {
                *a = ImageGrid::merge(vec![a.clone(), b.clone()]);
            }
            _ => return Err(Error::IncompatibleDatasets),
        }
        Ok(())
    }

    /// Merge pieces into one dataset. Empty pieces of another kind are ignored, non-empty
    /// ones are an error. `None` when there is nothing to merge.
    pub fn merge(pieces: Vec<Dataset>) -> Result<Option<Dataset>> {
        let Some(kind) = pieces
            .iter()
            .find(|p| !p.is_empty())
            .or(pieces.first())
            .map(Dataset::kind)
        else {
            return Ok(None);
        };

        let mut same_kind = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if piece.kind() == kind {
                same_kind.push(piece);
            } else if !piece.is_empty() {
                return Err(Error::IncompatibleDatasets);
            }
        }

        if kind == DatasetKind::ImageGrid {
            let grids = same_kind
                .into_iter()
                .filter_map(|p| match p {
                    Dataset::ImageGrid(grid) => Some(grid),
                    _ => None,
                })
                .collect();
            return Ok(Some(Dataset::ImageGrid(ImageGrid::merge(grids))));
        }

        let mut pieces = same_kind.into_iter();
        let mut merged = pieces.next().unwrap_or_else(|| Dataset::empty(kind));
        for piece in pieces {
            merged.append(&piece)?;
        }
        Ok(Some(merged))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use rand::prelude::*;
    use rand::SeedableRng;

    /// Seeded random point cloud.
    pub fn cloud_fixture(npoints: usize, seed: u64) -> Dataset {
        let mut range = StdRng::seed_from_u64(seed);
        let between = rand::distributions::Uniform::from(0.0..1.0);
        let points = (0..npoints)
            .map(|_| {
                [
                    between.sample(&mut range),
                    between.sample(&mut range),
                    between.sample(&mut range),
                ]
            })
            .collect();
        Dataset::PointCloud(PointCloud {
            points,
            scalars: Vec::new(),
            ghost: Vec::new(),
        })
    }

    /// Two tetrahedra sharing a face, shifted by `shift` along x.
    pub fn mesh_fixture(shift: f64) -> Dataset {
        Dataset::UnstructuredMesh(UnstructuredMesh {
            points: vec![
                [shift, 0., 0.],
                [shift + 1., 0., 0.],
                [shift, 1., 0.],
                [shift, 0., 1.],
                [shift + 1., 1., 1.],
            ],
            connectivity: vec![0, 1, 2, 3, 1, 2, 3, 4],
            offsets: vec![4, 8],
            cell_types: vec![10, 10],
            ghost: vec![false, true],
        })
    }

    pub fn image_fixture(extent: [i64; 6], value: f64) -> Dataset {
        let mut grid = ImageGrid::new(extent, [0.; 3], [0.5; 3], Vec::new());
        let dims = grid.dimensions();
        grid.scalars = vec![value; dims[0] * dims[1] * dims[2]];
        Dataset::ImageGrid(grid)
    }

    #[test]
    fn test_counts() {
        let mesh = mesh_fixture(0.);
        assert_eq!(mesh.number_of_points(), 5);
        assert_eq!(mesh.number_of_cells(), 2);
        assert_eq!(mesh.cell_ghost_flags(), Some(&[false, true][..]));

        let image = image_fixture([0, 3, 0, 2, 0, 0], 1.);
        assert_eq!(image.number_of_points(), 12);
        assert_eq!(image.number_of_cells(), 6);
        assert_eq!(image.cell_centers().len(), 6);

        assert!(Dataset::default().is_empty());
        assert!(Dataset::empty(DatasetKind::ImageGrid).is_empty());
    }

    #[test]
    fn test_append_mesh_shifts_connectivity() {
        let mut a = mesh_fixture(0.);
        a.append(&mesh_fixture(2.)).unwrap();
        let Dataset::UnstructuredMesh(mesh) = &a else {
            panic!("kind changed")
        };
        assert_eq!(mesh.points.len(), 10);
        assert_eq!(mesh.offsets, vec![4, 8, 12, 16]);
        assert_eq!(&mesh.connectivity[8..12], &[5, 6, 7, 8]);
        assert_eq!(mesh.ghost, vec![false, true, false, true]);
        assert_eq!(a.cell_centers()[2][0], 2.25);
    }

    #[test]
    fn test_merge_skips_foreign_empty_pieces() {
        let merged = Dataset::merge(vec![
            Dataset::default(),
            mesh_fixture(0.),
            Dataset::empty(DatasetKind::UnstructuredMesh),
            mesh_fixture(1.),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(merged.kind(), DatasetKind::UnstructuredMesh);
        assert_eq!(merged.number_of_cells(), 4);

        assert!(matches!(
            Dataset::merge(vec![mesh_fixture(0.), cloud_fixture(3, 0)]),
            Err(Error::IncompatibleDatasets)
        ));
        assert!(Dataset::merge(Vec::new()).unwrap().is_none());
    }

    #[test]
    fn test_merge_image_pieces_by_extent() {
        let merged = Dataset::merge(vec![
            image_fixture([0, 1, 0, 1, 0, 0], 1.),
            image_fixture([2, 3, 0, 1, 0, 0], 2.),
        ])
        .unwrap()
        .unwrap();
        let Dataset::ImageGrid(grid) = merged else {
            panic!("kind changed")
        };
        assert_eq!(grid.extent, [0, 3, 0, 1, 0, 0]);
        assert_eq!(grid.scalars, vec![1., 1., 2., 2., 1., 1., 2., 2.]);
    }

    #[test]
    fn test_extract_cells() {
        let mesh = mesh_fixture(0.);
        let second = mesh.extract_cells(&[1]);
        assert_eq!(second.number_of_cells(), 1);
        assert_eq!(second.number_of_points(), 4);
        assert_eq!(second.cell_ghost_flags(), Some(&[true][..]));

        let cloud = cloud_fixture(10, 1);
        let subset = cloud.extract_cells(&[0, 9]);
        assert_eq!(subset.cell_centers(), vec![cloud.cell_centers()[0], cloud.cell_centers()[9]]);

        let graph = Dataset::Graph(Graph {
            vertices: vec![[0.; 3], [1., 0., 0.], [2., 0., 0.]],
            edges: vec![[0, 1], [1, 2]],
        });
        let Dataset::Graph(edge) = graph.extract_cells(&[1]) else {
            panic!("kind changed")
        };
        assert_eq!(edge.vertices, vec![[1., 0., 0.], [2., 0., 0.]]);
        assert_eq!(edge.edges, vec![[0, 1]]);
    }
}
