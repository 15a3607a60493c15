//! C API for querying partition trees.
//!
//! Trees cross the boundary in the packed form produced by `PartitionTree::pack`. Functions
//! returning `i32` report 0 on success and -1 on failure.
use std::ptr;
use std::slice::{from_raw_parts, from_raw_parts_mut};

use tracing::warn;

use crate::partition::{assignment::AssignmentPolicy, tree::PartitionTree};

#[no_mangle]
pub extern "C" fn partition_tree_unpack(data: *const f64, len: usize) -> *mut PartitionTree {
    let packed = unsafe { from_raw_parts(data, len) };
    match PartitionTree::unpack(packed) {
        Ok(tree) => Box::into_raw(Box::new(tree)),
        Err(e) => {
            warn!("cannot unpack partition tree: {}", e);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "C" fn partition_tree_free(tree: *mut PartitionTree) {
    if !tree.is_null() {
        drop(unsafe { Box::from_raw(tree) });
    }
}

#[no_mangle]
pub extern "C" fn partition_tree_number_of_regions(tree: *const PartitionTree) -> usize {
    unsafe { (*tree).number_of_regions() }
}

#[no_mangle]
pub extern "C" fn partition_tree_locate(tree: *const PartitionTree, point: *const f64) -> usize {
    let point = unsafe { from_raw_parts(point, 3) };
    unsafe { (*tree).locate(&[point[0], point[1], point[2]]) }
}

/// Writes `[xmin, xmax, ymin, ymax, zmin, zmax]` to `out`.
#[no_mangle]
pub extern "C" fn partition_tree_region_bounds(tree: *const PartitionTree, region: usize, out: *mut f64) -> i32 {
    let out = unsafe { from_raw_parts_mut(out, 6) };
    match unsafe { (*tree).region_bounds(region) } {
        Ok(bounds) => {
            for dim in 0..3 {
                out[2 * dim] = bounds.min[dim];
                out[2 * dim + 1] = bounds.max[dim];
            }
            0
        }
        Err(_) => -1,
    }
}

/// `policy` is 0 for round robin and 1 for contiguous blocks.
#[no_mangle]
pub extern "C" fn partition_tree_assign_regions(tree: *mut PartitionTree, policy: u32, nprocs: usize) -> i32 {
    let policy = match policy {
        0 => AssignmentPolicy::RoundRobin,
        1 => AssignmentPolicy::Contiguous,
        _ => return -1,
    };
    match unsafe { (*tree).assign_regions(&policy, nprocs) } {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Writes the owning process of every region to `out`, which must hold one entry per region.
#[no_mangle]
pub extern "C" fn partition_tree_assignment(tree: *const PartitionTree, out: *mut usize) -> i32 {
    let tree = unsafe { &*tree };
    let out = unsafe { from_raw_parts_mut(out, tree.number_of_regions()) };
    match tree.assignment_map() {
        Ok(owners) => {
            out.copy_from_slice(owners);
            0
        }
        Err(_) => -1,
    }
}

/// Writes the owning processes in front-to-back order as seen from `eye` to `out`, which
/// must hold one entry per region.
#[no_mangle]
pub extern "C" fn partition_tree_view_order_from_position(
    tree: *const PartitionTree,
    eye: *const f64,
    out: *mut usize,
) -> i32 {
    let tree = unsafe { &*tree };
    let eye = unsafe { from_raw_parts(eye, 3) };
    let out = unsafe { from_raw_parts_mut(out, tree.number_of_regions()) };
    match tree.view_order_from_position(&[eye[0], eye[1], eye[2]]) {
        Ok(order) => {
            out[..order.len()].copy_from_slice(&order);
            0
        }
        Err(_) => -1,
    }
}
